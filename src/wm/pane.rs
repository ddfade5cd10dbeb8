//! Pane geometry - where the child's screen sits on the host terminal

/// The rectangle of host rows the child is confined to.
///
/// Rows are 1-based host rows. The pane always spans the full host width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaneGeometry {
    /// First host row of the pane
    pub row_offset: u16,
    /// Number of rows
    pub height: u16,
    /// Number of columns
    pub width: u16,
}

impl PaneGeometry {
    pub fn new(row_offset: u16, height: u16, width: u16) -> Self {
        Self {
            row_offset: row_offset.max(1),
            height: height.max(1),
            width: width.max(1),
        }
    }

    /// A pane of `requested_height` rows anchored to the bottom of a host
    /// terminal of `host_cols` x `host_rows`. The height is clamped so the
    /// pane never extends past the host screen.
    pub fn anchored_bottom(host_cols: u16, host_rows: u16, requested_height: u16) -> Self {
        let host_rows = host_rows.max(1);
        let height = requested_height.clamp(1, host_rows);
        Self::new(host_rows - height + 1, height, host_cols)
    }

    /// First host row
    pub fn top(&self) -> u16 {
        self.row_offset
    }

    /// Last host row
    pub fn bottom(&self) -> u16 {
        self.row_offset + self.height - 1
    }

    /// Clamp a pane-relative row into `1..=height`
    pub fn clamp_row(&self, row: u16) -> u16 {
        row.clamp(1, self.height)
    }

    /// Clamp a column into `1..=width`
    pub fn clamp_col(&self, col: u16) -> u16 {
        col.clamp(1, self.width)
    }

    /// Host row for a pane-relative row (clamped into the pane)
    pub fn host_row(&self, row: u16) -> u16 {
        self.row_offset + self.clamp_row(row) - 1
    }

    /// Check if a host row is inside this pane
    #[allow(dead_code)]
    pub fn contains_host_row(&self, host_row: u16) -> bool {
        host_row >= self.top() && host_row <= self.bottom()
    }
}
