//! Formatted tables for build summaries, centroids and search results.

use crate::dnc::BuildReport;
use crate::serving::{CentroidInfo, RefreshReport, SearchHit};
use crate::vector::VectorId;
use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Create a new table builder.
    pub fn new() -> Self {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.apply_modifier(UTF8_ROUND_CORNERS);
        Self { table }
    }

    /// Set the table headers.
    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        let header_cells: Vec<Cell> = headers
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect();
        self.table.set_header(header_cells);
        self
    }

    /// Add a row to the table.
    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Add a row of pre-styled cells.
    pub fn add_cells(mut self, row: Vec<Cell>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Build and return the formatted table.
    pub fn build(self) -> String {
        self.table.to_string()
    }
}

fn status_cell(cancelled: bool) -> Cell {
    if cancelled {
        Cell::new("cancelled (partial)")
            .fg(Color::Yellow)
            .add_attribute(Attribute::Bold)
    } else {
        Cell::new("complete").fg(Color::Green)
    }
}

/// Summary of a rebuild, with the divide-and-conquer stage when one ran.
pub fn create_build_table(
    build: Option<(&BuildReport, usize)>,
    refresh: &RefreshReport,
) -> String {
    let mut table = TableBuilder::new().set_headers(vec!["Stage", "Metric", "Value"]);

    if let Some((report, kept)) = build {
        table = table
            .add_row(vec!["build".into(), "input rows".into(), report.rows.to_string()])
            .add_row(vec!["build".into(), "tasks".into(), report.tasks.to_string()])
            .add_row(vec!["build".into(), "leaves".into(), report.leaves.to_string()])
            .add_row(vec!["build".into(), "leaves after pruning".into(), kept.to_string()])
            .add_row(vec!["build".into(), "max depth".into(), report.max_depth.to_string()])
            .add_row(vec![
                "build".into(),
                "failed branches".into(),
                report.failed_branches.to_string(),
            ])
            .add_cells(vec![
                Cell::new("build"),
                Cell::new("status"),
                status_cell(report.cancelled),
            ]);
    }

    table
        .add_row(vec!["serve".into(), "layout".into(), refresh.layout.to_string()])
        .add_row(vec!["serve".into(), "rows".into(), refresh.rows.to_string()])
        .add_row(vec!["serve".into(), "files".into(), refresh.files.to_string()])
        .add_row(vec!["serve".into(), "trainer batches".into(), refresh.batches.to_string()])
        .add_row(vec!["serve".into(), "time".into(), format!("{} ms", refresh.elapsed_ms)])
        .add_cells(vec![
            Cell::new("serve"),
            Cell::new("status"),
            status_cell(refresh.cancelled),
        ])
        .build()
}

/// One row per centroid file.
pub fn create_centroid_table(centroids: &[CentroidInfo]) -> String {
    let mut table = TableBuilder::new().set_headers(vec!["Centroid", "Rows", "File", "Updated"]);
    for info in centroids {
        let file = info
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        table = table.add_row(vec![
            info.index.to_string(),
            info.rows.to_string(),
            file,
            info.updated.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    table.build()
}

/// Ranked search results. `describe` supplies the text shown for each id.
pub fn create_search_table<F>(hits: &[SearchHit], offset: usize, describe: F) -> String
where
    F: Fn(VectorId) -> Option<String>,
{
    let mut table = TableBuilder::new().set_headers(vec!["Rank", "Id", "Score", "Document"]);
    for (rank, hit) in hits.iter().enumerate() {
        table = table.add_row(vec![
            (offset + rank + 1).to_string(),
            hit.id.to_string(),
            format!("{:.4}", hit.score),
            describe(hit.id).unwrap_or_default(),
        ]);
    }
    table.build()
}
