//! Import commands - CSV import, analysis, remapping and history

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use super::{get_context, is_interactive};
use crate::output;
use bankfeed_core::domain::{CanonicalField, FieldMapping};
use bankfeed_core::services::{ImportOptions, ImportResult, IngestProgress};

/// Parse a `column=field[:format]` argument. `column=-` leaves the column unmapped.
fn parse_mapping(arg: &str) -> Result<FieldMapping> {
    let (column, target) = arg
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("Invalid mapping '{}': expected column=field[:format]", arg))?;
    let column = column.trim();
    if column.is_empty() {
        bail!("Invalid mapping '{}': column name is empty", arg);
    }

    let target = target.trim();
    if target == "-" {
        return Ok(FieldMapping::unmapped(column));
    }

    let (field, format_id) = match target.split_once(':') {
        Some((field, fmt)) if !fmt.trim().is_empty() => (field, Some(fmt.trim().to_string())),
        Some((field, _)) => (field, None),
        None => (target, None),
    };
    let field = CanonicalField::parse(field.trim()).ok_or_else(|| {
        let known: Vec<_> = CanonicalField::ALL.iter().map(|f| f.as_str()).collect();
        anyhow!("Unknown field '{}' (expected one of: {})", field.trim(), known.join(", "))
    })?;
    Ok(FieldMapping::manual(column, field, format_id))
}

/// Apply user overrides on top of proposed mappings.
///
/// A field claimed by an override is released from every other column.
fn apply_overrides(mut base: Vec<FieldMapping>, overrides: &[FieldMapping], headers: &[String]) -> Result<Vec<FieldMapping>> {
    for over in overrides {
        if !headers.iter().any(|h| h == &over.column) {
            bail!("Column '{}' is not in the file (columns: {})", over.column, headers.join(", "));
        }
        if over.field.is_some() {
            for m in base.iter_mut().filter(|m| m.column != over.column && m.field == over.field) {
                *m = FieldMapping::unmapped(m.column.clone());
            }
        }
        match base.iter_mut().find(|m| m.column == over.column) {
            Some(existing) => *existing = over.clone(),
            None => base.push(over.clone()),
        }
    }
    Ok(base)
}

fn parse_mappings(args: &[String]) -> Result<Vec<FieldMapping>> {
    args.iter().map(|a| parse_mapping(a)).collect()
}

fn progress_bar(json: bool) -> Option<ProgressBar> {
    if json || !is_interactive() {
        return None;
    }
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} rows ({msg})") {
        pb.set_style(style);
    }
    Some(pb)
}

fn report_progress(pb: &ProgressBar, progress: IngestProgress) {
    pb.set_length(progress.total as u64);
    pb.set_position(progress.processed as u64);
    pb.set_message(format!(
        "{} new, {} duplicates",
        progress.counts.imported, progress.counts.skipped
    ));
}

pub fn run(file: &Path, source: &str, mappings: &[String], preview: bool, save_mappings: bool, json: bool) -> Result<()> {
    let overrides = parse_mappings(mappings)?;
    let ctx = get_context("import")?;
    let target = ctx.source_service.get(source)?;

    let mappings = if overrides.is_empty() {
        None
    } else {
        let analysis = ctx.import_service.analyze(file, &target)?;
        Some(apply_overrides(analysis.mappings, &overrides, &analysis.headers)?)
    };
    let options = ImportOptions {
        preview,
        save_mappings,
        mappings,
    };

    let pb = progress_bar(json);
    let callback = pb.as_ref().map(|pb| move |p: IngestProgress| report_progress(pb, p));
    let result = ctx.import_service.import(
        file,
        &target.id.to_string(),
        &options,
        callback.as_ref().map(|f| f as &dyn Fn(IngestProgress)),
    );
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let result = result.map_err(|e| {
        if let bankfeed_core::Error::Validation { missing } = &e {
            anyhow!(
                "Missing mappings for: {}. Check 'bf analyze {}' and pass --map column=field",
                missing.join(", "),
                file.display()
            )
        } else {
            e.into()
        }
    })?;

    if json {
        return output::json(&result);
    }
    print_result(&result, &target.name);
    Ok(())
}

fn print_result(result: &ImportResult, source_name: &str) {
    if result.preview {
        println!("{}", "PREVIEW MODE - No changes applied".yellow());
        println!();
    } else {
        output::success(&format!("Imported into '{}'", source_name));
    }

    println!("  Rows: {}", result.counts.total);
    println!("  New: {}", result.counts.imported);
    println!("  Skipped: {} (duplicates)", result.counts.skipped);
    if result.counts.errored > 0 {
        println!("  {} {}", "Errors:".red(), result.counts.errored);
        for err in result.row_errors.iter().take(5) {
            println!("    row {}: {}", err.row, err.message);
        }
        if result.row_errors.len() > 5 {
            println!("    ... and {} more", result.row_errors.len() - 5);
        }
    }
    for err in &result.batch_errors {
        println!("  {} {}", "Batch failed:".red(), err);
    }
    if let (Some(from), Some(to)) = (result.date_from, result.date_to) {
        println!("  Dates: {} to {}", from, to);
    }
    if let Some(id) = result.import_id {
        println!("  Import: {}", id.to_string().dimmed());
    }
}

pub fn analyze(file: &Path, source: &str, json: bool) -> Result<()> {
    let ctx = get_context("analyze")?;
    let target = ctx.source_service.get(source)?;
    let analysis = ctx.import_service.analyze(file, &target)?;

    if json {
        return output::json(&analysis);
    }

    println!(
        "{} rows, delimiter '{}'{}",
        analysis.row_count,
        analysis.delimiter,
        if analysis.reused_saved { ", using saved mappings" } else { "" }
    );

    let mut table = output::create_table();
    table.set_header(vec!["Column", "Field", "Format", "Confidence", "Method", "Sample"]);
    for mapping in &analysis.mappings {
        let sample = analysis
            .sample_rows
            .first()
            .and_then(|row| row.get(&mapping.column))
            .cloned()
            .unwrap_or_default();
        let field = match mapping.field {
            Some(f) if mapping.is_confirmed() => f.as_str().green().to_string(),
            Some(f) => format!("{}?", f.as_str()).yellow().to_string(),
            None => "-".dimmed().to_string(),
        };
        table.add_row(vec![
            mapping.column.clone(),
            field,
            mapping.format_id.clone().unwrap_or_default(),
            format!("{:.2}", mapping.confidence),
            format!("{:?}", mapping.method).to_lowercase(),
            sample,
        ]);
    }
    println!("{}", table);

    if analysis.missing.is_empty() {
        output::success("All required fields are mapped.");
    } else {
        output::warning(&format!("Missing: {}", analysis.missing.join(", ")));
        println!("  Pass --map column=field[:format] to 'bf import' to fill them in.");
    }
    Ok(())
}

pub fn remap(import_id: &str, mappings: &[String], json: bool) -> Result<()> {
    let import_id = Uuid::parse_str(import_id).context("Invalid import id")?;
    let overrides = parse_mappings(mappings)?;

    let ctx = get_context("remap")?;
    let record = ctx
        .repository
        .get_import_record(import_id)?
        .ok_or_else(|| anyhow!("Import {} not found", import_id))?;
    let mappings = apply_overrides(record.field_mappings.clone(), &overrides, &record.headers)?;

    let result = ctx
        .import_service
        .remap(import_id, mappings, &ImportOptions::default(), None)?;

    if json {
        return output::json(&result);
    }
    let name = ctx
        .repository
        .get_source(record.source_id)?
        .map(|s| s.name)
        .unwrap_or_else(|| record.source_id.to_string());
    print_result(&result, &name);
    Ok(())
}

pub fn list(source: Option<&str>, json: bool) -> Result<()> {
    let ctx = get_context("imports")?;
    let source_id = match source {
        Some(s) => Some(ctx.source_service.get(s)?.id),
        None => None,
    };
    let records = ctx.import_service.list_imports(source_id)?;

    if json {
        return output::json(&records);
    }
    if records.is_empty() {
        println!("No imports yet.");
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["ID", "File", "Date", "Rows", "New", "Skipped", "Errors", "Remap of"]);
    for r in &records {
        table.add_row(vec![
            r.id.to_string(),
            r.file_name.clone(),
            output::format_time(Some(r.created_at)),
            r.counts.total.to_string(),
            r.counts.imported.to_string(),
            r.counts.skipped.to_string(),
            r.counts.errored.to_string(),
            r.remapped_from.map(|id| id.to_string()).unwrap_or_default(),
        ]);
    }
    println!("{}", table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bankfeed_core::domain::MatchMethod;

    fn headers(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_parse_mapping_with_format() {
        let m = parse_mapping("Buchungstag=date:de").unwrap();
        assert_eq!(m.column, "Buchungstag");
        assert_eq!(m.field, Some(CanonicalField::Date));
        assert_eq!(m.format_id.as_deref(), Some("de"));
        assert!(m.user_confirmed);
        assert_eq!(m.method, MatchMethod::Manual);
    }

    #[test]
    fn test_parse_mapping_unmapped_and_case() {
        let m = parse_mapping("Notiz=-").unwrap();
        assert_eq!(m.field, None);

        let m = parse_mapping("IBAN=PartnerIban").unwrap();
        assert_eq!(m.field, Some(CanonicalField::PartnerIban));
        assert_eq!(m.format_id, None);
    }

    #[test]
    fn test_parse_mapping_errors() {
        assert!(parse_mapping("no-equals").is_err());
        assert!(parse_mapping("=date").is_err());
        assert!(parse_mapping("Col=balance").is_err());
    }

    #[test]
    fn test_override_releases_field_from_other_column() {
        let base = vec![
            FieldMapping::manual("Valuta", CanonicalField::Date, Some("de".into())),
            FieldMapping::unmapped("Buchungstag"),
        ];
        let over = [parse_mapping("Buchungstag=date:de").unwrap()];
        let merged = apply_overrides(base, &over, &headers(&["Valuta", "Buchungstag"])).unwrap();

        assert_eq!(merged[0].field, None);
        assert_eq!(merged[1].field, Some(CanonicalField::Date));
    }

    #[test]
    fn test_override_unknown_column() {
        let over = [parse_mapping("Missing=amount").unwrap()];
        assert!(apply_overrides(Vec::new(), &over, &headers(&["Betrag"])).is_err());
    }
}
