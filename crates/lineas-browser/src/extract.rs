//! Result table extraction.
//!
//! Parses the `#GridConsulta` table rendered by the lookup service into
//! [`ExtractedLine`]s. Pager rows, hidden rows and loading placeholders are
//! skipped; at most [`MAX_ROWS_PER_PAGE`] rows are taken from one page.

use lineas_core::ExtractedLine;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;

/// Upper bound on rows read from a single result page.
pub const MAX_ROWS_PER_PAGE: usize = 100;

const LOADING_MARKERS: [&str; 3] = ["Cargando", "Loading", "Procesando"];
const NO_RESULTS_MARKER: &str = "No se encontraron";

/// One parsed result page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePage {
    pub lines: Vec<ExtractedLine>,
    /// Visible rows that still look like data or a loading placeholder
    pub visible_rows: usize,
    /// Whether the pager offers a next page
    pub has_more: bool,
    /// Whether the result table exists at all
    pub table_present: bool,
}

impl TablePage {
    /// Rows are on screen but none parsed: the table is probably still rendering.
    #[must_use]
    pub fn looks_incomplete(&self) -> bool {
        self.lines.is_empty() && self.visible_rows > 0
    }
}

fn selector(cell: &'static OnceLock<Selector>, css: &str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).expect("valid selector"))
}

fn table_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "#GridConsulta")
}

fn row_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "tr")
}

fn cell_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "td")
}

fn next_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    selector(&SEL, "#GridConsulta_next")
}

/// Parse a full page document.
#[must_use]
pub fn parse_results_table(html: &str) -> TablePage {
    let document = Html::parse_document(html);

    let Some(table) = document.select(table_selector()).next() else {
        return TablePage::default();
    };

    let mut page = TablePage {
        table_present: true,
        has_more: has_next_page(&document),
        ..TablePage::default()
    };

    for (index, row) in table.select(row_selector()).enumerate() {
        if index == 0 || is_pager(&row) || is_hidden(&row) {
            continue;
        }

        let cells: Vec<String> = row.select(cell_selector()).map(cell_text).collect();
        let first = cells.first().map(String::as_str).unwrap_or_default();

        if first.is_empty() || first.contains(NO_RESULTS_MARKER) {
            continue;
        }
        page.visible_rows += 1;

        if cells.len() < 3 || LOADING_MARKERS.iter().any(|m| first.contains(m)) {
            continue;
        }

        if page.lines.len() < MAX_ROWS_PER_PAGE {
            page.lines.push(ExtractedLine {
                modality: cells[0].clone(),
                phone_number: cells[1].clone(),
                operator_name: cells[2].clone(),
            });
        }
    }

    page
}

fn has_next_page(document: &Html) -> bool {
    document.select(next_selector()).next().is_some_and(|next| {
        !next
            .value()
            .attr("class")
            .is_some_and(|class| class.contains("disabled"))
    })
}

fn is_pager(row: &ElementRef) -> bool {
    row.value()
        .attr("class")
        .is_some_and(|class| class.contains("GridPager"))
}

fn is_hidden(row: &ElementRef) -> bool {
    row.value().attr("style").is_some_and(|style| {
        let compact: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        compact.contains("display:none") || compact.contains("visibility:hidden")
    })
}

fn cell_text(cell: ElementRef) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
