//! CSV report per (date, keyword) and its rendered HTML view.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use askama::Template;
use chrono::NaiveDate;
use flipscan_core::ReportRow;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone)]
struct PictureRowView {
    url: String,
    picture_url: String,
    candidate_price: String,
    reference_price: String,
    profit_or_margin: String,
    confidence: String,
    email: String,
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportPageTemplate<'a> {
    keyword: &'a str,
    date: String,
    rows: Vec<PictureRowView>,
}

#[derive(Debug, Clone)]
pub struct ReportSink {
    root: PathBuf,
}

impl ReportSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn csv_path(&self, date: NaiveDate, keyword: &str) -> PathBuf {
        self.day_dir(date)
            .join(format!("{}.csv", keyword_slug(keyword)))
    }

    pub fn html_path(&self, date: NaiveDate, keyword: &str) -> PathBuf {
        self.day_dir(date)
            .join(format!("{}.html", keyword_slug(keyword)))
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format("%Y-%m-%d").to_string())
    }

    /// Appends one row (header first on a new file), then rewrites the HTML view.
    pub async fn append(&self, row: &ReportRow) -> Result<PathBuf> {
        let csv_path = self.csv_path(row.date, &row.keyword);
        if let Some(parent) = csv_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating report directory {}", parent.display()))?;
        }

        let needs_header = match fs::metadata(&csv_path).await {
            Ok(meta) => meta.len() == 0,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => {
                return Err(err).with_context(|| format!("inspecting {}", csv_path.display()))
            }
        };

        let mut chunk = String::new();
        if needs_header {
            chunk.push_str(&csv_line(ReportRow::COLUMNS.iter().copied()));
        }
        let fields = row_fields(row);
        chunk.push_str(&csv_line(fields.iter().map(String::as_str)));

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&csv_path)
            .await
            .with_context(|| format!("opening {}", csv_path.display()))?;
        file.write_all(chunk.as_bytes())
            .await
            .with_context(|| format!("appending to {}", csv_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", csv_path.display()))?;
        drop(file);

        let shown = self.render_view(row.date, &row.keyword).await?;
        debug!(path = %csv_path.display(), picture_rows = shown, "report updated");
        Ok(csv_path)
    }

    /// Rebuilds the HTML view from the CSV, keeping only rows with a picture.
    pub async fn render_view(&self, date: NaiveDate, keyword: &str) -> Result<usize> {
        let csv_path = self.csv_path(date, keyword);
        let text = fs::read_to_string(&csv_path)
            .await
            .with_context(|| format!("reading {}", csv_path.display()))?;
        let records = parse_csv(&text);
        let Some((header, body)) = records.split_first() else {
            return Ok(0);
        };

        let column = |name: &str| header.iter().position(|h| h == name);
        let cell = |record: &[String], idx: Option<usize>| {
            idx.and_then(|i| record.get(i)).cloned().unwrap_or_default()
        };
        let (url, picture, price, reference, profit, confidence, email) = (
            column("url"),
            column("picture_url"),
            column("candidate_price"),
            column("reference_price"),
            column("profit_or_margin"),
            column("picture_confidence"),
            column("email"),
        );

        let rows = body
            .iter()
            .filter(|record| !cell(record, picture).trim().is_empty())
            .map(|record| PictureRowView {
                url: cell(record, url),
                picture_url: cell(record, picture),
                candidate_price: cell(record, price),
                reference_price: cell(record, reference),
                profit_or_margin: cell(record, profit),
                confidence: cell(record, confidence),
                email: cell(record, email),
            })
            .collect::<Vec<_>>();
        let shown = rows.len();

        let page = ReportPageTemplate {
            keyword,
            date: date.format("%Y-%m-%d").to_string(),
            rows,
        }
        .render()
        .context("rendering report view")?;

        let html_path = self.html_path(date, keyword);
        fs::write(&html_path, page)
            .await
            .with_context(|| format!("writing {}", html_path.display()))?;
        Ok(shown)
    }
}

fn keyword_slug(keyword: &str) -> String {
    let mut slug = String::with_capacity(keyword.len());
    for c in keyword.trim().to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "keyword".to_string()
    } else {
        slug.to_string()
    }
}

fn row_fields(row: &ReportRow) -> [String; 11] {
    [
        row.date.format("%Y-%m-%d").to_string(),
        row.keyword.clone(),
        row.category.clone(),
        row.matches.to_string(),
        row.reference_price.to_string(),
        row.candidate_price.to_string(),
        format!("{:.2}", row.profit_or_margin),
        row.picture_confidence
            .map(|c| format!("{c:.1}"))
            .unwrap_or_default(),
        row.url.clone(),
        row.email.clone().unwrap_or_default(),
        row.picture_url.clone().unwrap_or_default(),
    ]
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn csv_line<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut line = fields.map(csv_field).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, embedded newlines.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(url: &str, picture: Option<&str>) -> ReportRow {
        ReportRow {
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            keyword: "Brass Lamp".into(),
            category: "fua".into(),
            matches: true,
            reference_price: 90,
            candidate_price: 40,
            profit_or_margin: 45.0,
            picture_confidence: Some(91.2),
            url: url.into(),
            email: Some("relay@sale.craigslist.org".into()),
            picture_url: picture.map(str::to_string),
        }
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn parser_reads_back_quoted_records() {
        let text = "a,b,c\n\"x, y\",\"multi\nline\",\"q\"\"uote\"\n1,,3";
        let records = parse_csv(text);
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], vec!["x, y", "multi\nline", "q\"uote"]);
        assert_eq!(records[2], vec!["1", "", "3"]);
    }

    #[test]
    fn keyword_slugs_are_path_safe() {
        assert_eq!(keyword_slug("Eames Chair / Herman-Miller"), "eames-chair-herman-miller");
        assert_eq!(keyword_slug("  ?? "), "keyword");
    }

    #[tokio::test]
    async fn header_is_written_once_and_view_keeps_picture_rows() {
        let dir = tempdir().unwrap();
        let sink = ReportSink::new(dir.path());

        let first = row(
            "https://sfbay.craigslist.org/fuo/d/lamp/7001.html",
            Some("https://images.craigslist.org/7001_600x450.jpg"),
        );
        let second = row("https://sfbay.craigslist.org/fuo/d/lamp/7002.html", None);
        let path = sink.append(&first).await.unwrap();
        sink.append(&second).await.unwrap();

        assert!(path.ends_with("2026-03-01/brass-lamp.csv"));
        let records = parse_csv(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], ReportRow::COLUMNS.to_vec());
        assert_eq!(records[1][6], "45.00");
        assert_eq!(records[1][7], "91.2");
        assert_eq!(records[2][10], "");

        let html = std::fs::read_to_string(sink.html_path(first.date, &first.keyword)).unwrap();
        assert!(html.contains("7001_600x450"));
        assert!(!html.contains("7002"));
        assert_eq!(sink.render_view(first.date, &first.keyword).await.unwrap(), 1);
    }
}
