use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};
use zip::result::ZipError;
use zip::ZipArchive;

pub const EMPTY_SHEET: &str = "(empty sheet)";
pub const EMPTY_WORKBOOK: &str = "(empty workbook)";

// XFD, the last column Excel can address
const MAX_COLUMNS: usize = 16_384;

struct SheetRef {
    name: String,
    rel_id: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CellKind {
    SharedString,
    Boolean,
    Other,
}

struct PendingCell {
    column: Option<usize>,
    kind: CellKind,
    value: String,
}

/// Flatten an .xlsx workbook into one text table per sheet, in workbook order
pub fn flatten_workbook(bytes: &[u8]) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("Not a valid xlsx archive")?;

    let shared = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };

    let workbook = read_entry(&mut archive, "xl/workbook.xml")?
        .context("Workbook is missing xl/workbook.xml")?;
    let sheets = parse_workbook_sheets(&workbook)?;
    if sheets.is_empty() {
        return Ok(EMPTY_WORKBOOK.to_string());
    }

    let rels = match read_entry(&mut archive, "xl/_rels/workbook.xml.rels")? {
        Some(xml) => parse_relationships(&xml)?,
        None => HashMap::new(),
    };

    let mut sections = Vec::with_capacity(sheets.len());
    for (index, sheet) in sheets.iter().enumerate() {
        let path = sheet
            .rel_id
            .as_ref()
            .and_then(|id| rels.get(id))
            .map(|target| resolve_target(target))
            .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", index + 1));

        let xml = read_entry(&mut archive, &path)?
            .with_context(|| format!("Sheet '{}' is missing ({})", sheet.name, path))?;
        let rows = parse_sheet_rows(&xml, &shared)
            .with_context(|| format!("Failed to read sheet '{}'", sheet.name))?;

        sections.push(format!("## Sheet: {}\n{}", sheet.name, render_table(&rows)));
    }

    Ok(sections.join("\n\n"))
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<String>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to open entry {}", name)),
    };

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .with_context(|| format!("Failed to read entry {}", name))?;
    Ok(Some(xml))
}

fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    // phonetic hints repeat the text in another script
    let mut in_phonetic = false;

    loop {
        match reader.read_event().context("Malformed sharedStrings.xml")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = !in_phonetic,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"si" {
                    strings.push(String::new());
                }
            }
            Event::Text(t) => {
                if in_text {
                    if let Some(s) = current.as_mut() {
                        s.push_str(&t.unescape()?);
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                b"rPh" => in_phonetic = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(strings)
}

fn parse_workbook_sheets(xml: &str) -> Result<Vec<SheetRef>> {
    let mut reader = Reader::from_str(xml);
    let mut sheets = Vec::new();

    loop {
        match reader.read_event().context("Malformed workbook.xml")? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let mut name = None;
                let mut rel_id = None;
                for attr in e.attributes() {
                    let attr = attr?;
                    let key = attr.key.as_ref();
                    if key == b"name" {
                        name = Some(attr.unescape_value()?.into_owned());
                    } else if key.ends_with(b":id") {
                        rel_id = Some(attr.unescape_value()?.into_owned());
                    }
                }
                let name = name.unwrap_or_else(|| format!("Sheet{}", sheets.len() + 1));
                sheets.push(SheetRef { name, rel_id });
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(sheets)
}

fn parse_relationships(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut rels = HashMap::new();

    loop {
        match reader.read_event().context("Malformed workbook.xml.rels")? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                let mut id = None;
                let mut target = None;
                for attr in e.attributes() {
                    let attr = attr?;
                    match attr.key.as_ref() {
                        b"Id" => id = Some(attr.unescape_value()?.into_owned()),
                        b"Target" => target = Some(attr.unescape_value()?.into_owned()),
                        _ => {}
                    }
                }
                if let (Some(id), Some(target)) = (id, target) {
                    rels.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(rels)
}

fn start_cell(e: &BytesStart) -> Result<PendingCell> {
    let mut column = None;
    let mut kind = CellKind::Other;
    for attr in e.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"r" => column = column_index(&attr.unescape_value()?)?,
            b"t" => {
                kind = match &*attr.unescape_value()? {
                    "s" => CellKind::SharedString,
                    "b" => CellKind::Boolean,
                    _ => CellKind::Other,
                }
            }
            _ => {}
        }
    }
    Ok(PendingCell {
        column,
        kind,
        value: String::new(),
    })
}

/// "C7" -> 2. References past column XFD are rejected.
fn column_index(reference: &str) -> Result<Option<usize>> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if letters.is_empty() {
        return Ok(None);
    }

    let mut number = 0usize;
    for b in &letters {
        number = number
            .checked_mul(26)
            .and_then(|n| n.checked_add((b - b'A' + 1) as usize))
            .filter(|n| *n <= MAX_COLUMNS)
            .with_context(|| format!("Cell reference '{}' is beyond column XFD", reference))?;
    }
    Ok(Some(number - 1))
}

fn finish_cell(row: &mut Vec<String>, cell: PendingCell, shared: &[String]) -> Result<()> {
    let value = match cell.kind {
        CellKind::SharedString => {
            let index: usize = cell
                .value
                .trim()
                .parse()
                .with_context(|| format!("Bad shared string index '{}'", cell.value))?;
            shared
                .get(index)
                .cloned()
                .with_context(|| format!("Shared string {} out of range", index))?
        }
        CellKind::Boolean => match cell.value.trim() {
            "1" => "TRUE".to_string(),
            "0" => "FALSE".to_string(),
            other => other.to_string(),
        },
        CellKind::Other => cell.value,
    };

    let column = cell.column.unwrap_or(row.len());
    if row.len() <= column {
        row.resize(column + 1, String::new());
    }
    row[column] = value;
    Ok(())
}

fn parse_sheet_rows(xml: &str, shared: &[String]) -> Result<Vec<Vec<String>>> {
    let mut reader = Reader::from_str(xml);
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell: Option<PendingCell> = None;
    let mut in_value = false;

    loop {
        match reader.read_event().context("Malformed worksheet XML")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => cell = Some(start_cell(&e)?),
                b"v" | b"t" => in_value = cell.is_some(),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"row" => rows.push(Vec::new()),
                b"c" => finish_cell(&mut row, start_cell(&e)?, shared)?,
                _ => {}
            },
            Event::Text(t) => {
                if in_value {
                    if let Some(c) = cell.as_mut() {
                        c.value.push_str(&t.unescape()?);
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    if let Some(c) = cell.take() {
                        finish_cell(&mut row, c, shared)?;
                    }
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(rows)
}

fn render_table(rows: &[Vec<String>]) -> String {
    let rows: Vec<&Vec<String>> = rows
        .iter()
        .filter(|r| r.iter().any(|c| !c.trim().is_empty()))
        .collect();
    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    if width == 0 {
        return EMPTY_SHEET.to_string();
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    for (index, row) in rows.iter().enumerate() {
        let cells: Vec<String> = (0..width)
            .map(|i| row.get(i).map(|c| table_cell(c)).unwrap_or_default())
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
        if index == 0 {
            lines.push(format!("|{}", " --- |".repeat(width)));
        }
    }
    lines.join("\n")
}

fn table_cell(value: &str) -> String {
    value
        .trim()
        .replace('|', "\\|")
        .replace("\r\n", " ")
        .replace('\n', " ")
}
