//! Import service - CSV transaction import

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::duckdb::DuckDbRepository;
use crate::domain::mapping::{confirmed_for, missing_required};
use crate::domain::result::{Error, Result};
use crate::domain::{
    normalize_iban, CanonicalField, FieldMapping, ImportRecord, IncomingTransaction, IngestCounts,
    IngestOrigin, RowError, Source,
};
use crate::parsing::{parse_amount, parse_date, parse_date_any, Region};
use crate::services::column_matcher::ColumnMatcher;
use crate::services::ingest::{IngestPipeline, IngestProgress};
use crate::services::logging::{events, LogEvent, LoggingService};

/// Delimiters tried when sniffing, in preference order
const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Rows handed to the matcher for content detection
const SAMPLE_ROWS: usize = 50;

/// A parsed CSV file
#[derive(Debug, Clone, Serialize)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
    pub delimiter: char,
}

/// Read a CSV file, sniffing the delimiter and dropping a UTF-8 BOM.
///
/// Files that are not valid UTF-8 are read as Latin-1, which is what most
/// German bank exports use.
pub fn read_csv_file(path: &Path) -> anyhow::Result<CsvTable> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    read_csv_bytes(&bytes)
}

pub fn read_csv_bytes(bytes: &[u8]) -> anyhow::Result<CsvTable> {
    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    };
    let text = text.trim_start_matches('\u{feff}');

    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let delimiter = sniff_delimiter(first_line);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("CSV file has no header row")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("Malformed CSV record")?;
        if record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let row = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), record.get(i).unwrap_or("").trim().to_string()))
            .collect();
        rows.push(row);
    }

    Ok(CsvTable {
        headers,
        rows,
        delimiter: delimiter as char,
    })
}

fn sniff_delimiter(line: &str) -> u8 {
    let mut best = (b',', 0usize);
    for delim in DELIMITERS {
        let mut count = 0;
        let mut in_quotes = false;
        for b in line.bytes() {
            match b {
                b'"' => in_quotes = !in_quotes,
                b if b == delim && !in_quotes => count += 1,
                _ => {}
            }
        }
        if count > best.1 {
            best = (delim, count);
        }
    }
    best.0
}

/// Import knobs
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Parse and dedupe-check only
    pub preview: bool,
    /// Store the mappings on the source for later imports
    pub save_mappings: bool,
    /// Mappings to use instead of the matcher's proposal
    pub mappings: Option<Vec<FieldMapping>>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            preview: false,
            save_mappings: true,
            mappings: None,
        }
    }
}

/// Matcher output for a file, before anything is imported
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvAnalysis {
    pub headers: Vec<String>,
    pub sample_rows: Vec<BTreeMap<String, String>>,
    pub delimiter: char,
    pub mappings: Vec<FieldMapping>,
    /// Required fields without a confirmed mapping
    pub missing: Vec<String>,
    /// Mappings came from the source rather than the matcher
    pub reused_saved: bool,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    /// None for previews
    pub import_id: Option<Uuid>,
    pub source_id: Uuid,
    pub counts: IngestCounts,
    pub row_errors: Vec<RowError>,
    pub batch_errors: Vec<String>,
    pub date_from: Option<chrono::NaiveDate>,
    pub date_to: Option<chrono::NaiveDate>,
    pub preview: bool,
}

/// Import service for CSV imports
pub struct ImportService {
    repository: Arc<DuckDbRepository>,
    imports_dir: PathBuf,
    matcher: ColumnMatcher,
    region: Region,
    logger: Option<Arc<LoggingService>>,
}

impl ImportService {
    pub fn new(repository: Arc<DuckDbRepository>, data_dir: &Path, region: Region) -> Self {
        Self {
            repository,
            imports_dir: data_dir.join("imports"),
            matcher: ColumnMatcher::new(region),
            region,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<LoggingService>) -> Self {
        self.logger = Some(logger);
        self
    }

    fn log(&self, event: LogEvent) {
        if let Some(logger) = &self.logger {
            logger.record(event);
        }
    }

    /// Propose mappings for a file destined for `source`
    pub fn analyze(&self, file_path: &Path, source: &Source) -> Result<CsvAnalysis> {
        let table = read_csv_file(file_path).map_err(|e| Error::Parse(format!("{:#}", e)))?;
        Ok(self.analyze_table(&table, source))
    }

    fn analyze_table(&self, table: &CsvTable, source: &Source) -> CsvAnalysis {
        let saved = source
            .field_mappings
            .as_deref()
            .and_then(|saved| self.matcher.reuse(saved, &table.headers));
        let reused_saved = saved.is_some();

        let samples = &table.rows[..table.rows.len().min(SAMPLE_ROWS)];
        let mappings = saved.unwrap_or_else(|| self.matcher.analyze(&table.headers, samples));
        let missing = self.matcher.missing(&mappings);

        CsvAnalysis {
            headers: table.headers.clone(),
            sample_rows: samples.iter().take(10).cloned().collect(),
            delimiter: table.delimiter,
            mappings,
            missing,
            reused_saved,
            row_count: table.rows.len(),
        }
    }

    /// Import a CSV file into a source
    pub fn import(
        &self,
        file_path: &Path,
        source_ref: &str,
        options: &ImportOptions,
        progress: Option<&dyn Fn(IngestProgress)>,
    ) -> Result<ImportResult> {
        let source = self.repository.resolve_source(source_ref)?;
        let table = read_csv_file(file_path).map_err(|e| Error::Parse(format!("{:#}", e)))?;
        let mappings = match &options.mappings {
            Some(m) => m.clone(),
            None => self.analyze_table(&table, &source).mappings,
        };

        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "import.csv".to_string());

        self.run(&source, &table, mappings, ImportInput::File { path: file_path, file_name }, options, progress)
    }

    /// Re-run a stored import with new mappings.
    ///
    /// The rows stored by the original import and by any earlier remap of it
    /// are superseded, so each line of the file ends up as one live row.
    pub fn remap(
        &self,
        import_id: Uuid,
        mappings: Vec<FieldMapping>,
        options: &ImportOptions,
        progress: Option<&dyn Fn(IngestProgress)>,
    ) -> Result<ImportResult> {
        let record = self
            .repository
            .get_import_record(import_id)?
            .ok_or_else(|| Error::not_found(format!("Import {}", import_id)))?;
        let source = self
            .repository
            .get_source(record.source_id)?
            .ok_or_else(|| Error::not_found(format!("Source {}", record.source_id)))?;
        let table = read_csv_file(Path::new(&record.raw_file_path))
            .map_err(|e| Error::Parse(format!("{:#}", e)))?;

        self.run(&source, &table, mappings, ImportInput::Stored(&record), options, progress)
    }

    pub fn list_imports(&self, source_id: Option<Uuid>) -> Result<Vec<ImportRecord>> {
        self.repository.list_import_records(source_id)
    }

    fn run(
        &self,
        source: &Source,
        table: &CsvTable,
        mappings: Vec<FieldMapping>,
        input: ImportInput<'_>,
        options: &ImportOptions,
        progress: Option<&dyn Fn(IngestProgress)>,
    ) -> Result<ImportResult> {
        let missing = missing_required(&mappings);
        if !missing.is_empty() {
            self.log(
                LogEvent::new(events::IMPORT_BLOCKED)
                    .with_source(source.id)
                    .with_error(format!("missing mappings: {}", missing.join(", "))),
            );
            return Err(Error::Validation { missing });
        }

        let import_id = Uuid::new_v4();
        let mapper = RowMapper::new(&mappings, self.region);

        let mut candidates = Vec::with_capacity(table.rows.len());
        let mut row_errors = Vec::new();
        for (idx, row) in table.rows.iter().enumerate() {
            match mapper.map(row) {
                Ok(tx) => candidates.push(tx),
                Err(message) => row_errors.push(RowError {
                    row: idx + 1,
                    message,
                    raw: row.clone(),
                }),
            }
        }

        if options.preview {
            let outcome = IngestPipeline::new(self.repository.as_ref())
                .preview(true)
                .run(source, IngestOrigin::Import(import_id), candidates, progress)?;
            let mut counts = outcome.counts;
            counts.merge(IngestCounts::rejected(row_errors.len()));
            return Ok(ImportResult {
                import_id: None,
                source_id: source.id,
                counts,
                row_errors,
                batch_errors: outcome.batch_errors,
                date_from: outcome.date_from,
                date_to: outcome.date_to,
                preview: true,
            });
        }

        // The record goes in before any row so every stored row has one
        let (file_name, raw_file_path, copied, parent) = match input {
            ImportInput::File { path, file_name } => {
                let stored = self.store_raw_file(path, import_id, &file_name)?;
                (file_name, stored, true, None)
            }
            ImportInput::Stored(record) => (record.file_name.clone(), record.raw_file_path.clone(), false, Some(record)),
        };
        let mut record = ImportRecord {
            id: import_id,
            source_id: source.id,
            file_name,
            raw_file_path,
            headers: table.headers.clone(),
            field_mappings: mappings.clone(),
            counts: IngestCounts::default(),
            row_errors: Vec::new(),
            date_from: None,
            date_to: None,
            remapped_from: parent.map(|p| p.id),
            created_at: Utc::now(),
        };
        if let Err(e) = self.repository.insert_import_record(&record) {
            if copied {
                let _ = fs::remove_file(&record.raw_file_path);
            }
            return Err(e);
        }

        // A remap replaces what every earlier run of the same file stored
        let lineage = match parent {
            Some(parent) => self.import_lineage(parent)?,
            None => Vec::new(),
        };
        let superseded_at = Utc::now();
        let superseded = match self.repository.supersede_import_rows(source.id, &lineage, superseded_at) {
            Ok(n) => n,
            Err(e) => {
                self.repository.delete_import_record(import_id)?;
                return Err(e);
            }
        };

        let outcome = match IngestPipeline::new(self.repository.as_ref()).run(
            source,
            IngestOrigin::Import(import_id),
            candidates,
            progress,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.repository.restore_import_rows(source.id, &lineage, superseded_at)?;
                self.repository.delete_import_record(import_id)?;
                return Err(e);
            }
        };

        if superseded > 0 && !outcome.batch_errors.is_empty() {
            let restored = self.repository.restore_import_rows(source.id, &lineage, superseded_at)?;
            tracing::warn!(
                source_id = %source.id,
                import_id = %import_id,
                restored,
                "remap partially failed; earlier rows restored"
            );
        }

        let mut counts = outcome.counts;
        counts.merge(IngestCounts::rejected(row_errors.len()));
        record.counts = counts;
        record.row_errors = row_errors.clone();
        record.date_from = outcome.date_from;
        record.date_to = outcome.date_to;
        self.repository.update_import_record(&record)?;

        if options.save_mappings {
            self.repository.set_source_field_mappings(source.id, &mappings)?;
        }

        tracing::info!(
            source_id = %source.id,
            import_id = %import_id,
            total = counts.total,
            imported = counts.imported,
            skipped = counts.skipped,
            errored = counts.errored,
            "csv import finished"
        );
        self.log(
            LogEvent::new(events::IMPORT_COMPLETED)
                .with_source(source.id)
                .with_error_details(format!(
                    "total={} imported={} skipped={} errored={}",
                    counts.total, counts.imported, counts.skipped, counts.errored
                )),
        );

        Ok(ImportResult {
            import_id: Some(import_id),
            source_id: source.id,
            counts,
            row_errors,
            batch_errors: outcome.batch_errors,
            date_from: outcome.date_from,
            date_to: outcome.date_to,
            preview: false,
        })
    }

    /// Every import of the same uploaded file: the original and all its remaps
    fn import_lineage(&self, record: &ImportRecord) -> Result<Vec<Uuid>> {
        let parents: HashMap<Uuid, Option<Uuid>> = self
            .repository
            .list_import_records(Some(record.source_id))?
            .into_iter()
            .map(|r| (r.id, r.remapped_from))
            .collect();
        let root_of = |mut id: Uuid| {
            let mut hops = 0;
            while let Some(Some(parent)) = parents.get(&id) {
                if hops > parents.len() {
                    break;
                }
                id = *parent;
                hops += 1;
            }
            id
        };

        let root = root_of(record.id);
        Ok(parents.keys().copied().filter(|id| root_of(*id) == root).collect())
    }

    fn store_raw_file(&self, path: &Path, import_id: Uuid, file_name: &str) -> Result<String> {
        fs::create_dir_all(&self.imports_dir)?;
        let target = self.imports_dir.join(format!("{}-{}", import_id, file_name));
        fs::copy(path, &target)?;
        Ok(target.to_string_lossy().to_string())
    }
}

enum ImportInput<'a> {
    File { path: &'a Path, file_name: String },
    Stored(&'a ImportRecord),
}

/// Turns one CSV row into a candidate using confirmed mappings only
struct RowMapper<'a> {
    date: Option<&'a FieldMapping>,
    amount: Option<&'a FieldMapping>,
    name: Option<&'a FieldMapping>,
    partner: Option<&'a FieldMapping>,
    reference: Option<&'a FieldMapping>,
    partner_iban: Option<&'a FieldMapping>,
    region: Region,
}

impl<'a> RowMapper<'a> {
    fn new(mappings: &'a [FieldMapping], region: Region) -> Self {
        Self {
            date: confirmed_for(mappings, CanonicalField::Date),
            amount: confirmed_for(mappings, CanonicalField::Amount),
            name: confirmed_for(mappings, CanonicalField::Name),
            partner: confirmed_for(mappings, CanonicalField::Partner),
            reference: confirmed_for(mappings, CanonicalField::Reference),
            partner_iban: confirmed_for(mappings, CanonicalField::PartnerIban),
            region,
        }
    }

    fn map(&self, row: &BTreeMap<String, String>) -> std::result::Result<IncomingTransaction, String> {
        let value = |m: Option<&FieldMapping>| {
            m.and_then(|m| row.get(&m.column))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let raw_date = value(self.date).ok_or("Missing date")?;
        let date = match self.date.and_then(|m| m.format_id.as_deref()) {
            Some(format_id) => parse_date(raw_date, format_id),
            None => parse_date_any(raw_date).map(|(d, _)| d),
        }
        .ok_or_else(|| format!("Invalid date '{}'", raw_date))?;

        let raw_amount = value(self.amount).ok_or("Missing amount")?;
        let amount_format = self
            .amount
            .and_then(|m| m.format_id.as_deref())
            .unwrap_or_else(|| self.region.default_amount_format());
        let amount = parse_amount(raw_amount, amount_format)
            .ok_or_else(|| format!("Invalid amount '{}' for format {}", raw_amount, amount_format))?;

        let partner = value(self.partner).map(str::to_string);
        let booking_text = value(self.name).map(str::to_string);
        let name = partner
            .clone()
            .or_else(|| booking_text.clone())
            .unwrap_or_else(|| "Unknown".to_string());

        let mut tx = IncomingTransaction::new(date, amount, name);
        tx.description = booking_text.filter(|_| partner.is_some());
        tx.counterparty_name = partner;
        tx.reference = value(self.reference).map(str::to_string);
        tx.counterparty_iban = value(self.partner_iban).map(normalize_iban);
        tx.original = serde_json::to_value(row).unwrap_or(serde_json::Value::Null);
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceKind;
    use chrono::NaiveDate;
    use std::io::Write;
    use tempfile::TempDir;

    const GERMAN_CSV: &str = "\u{feff}Buchungsdatum;Betrag;Empfänger;Verwendungszweck\n\
        15.03.2024;-1.234,56;Stadtwerke;Strom März\n\
        16.03.2024;2.500,00;Arbeitgeber GmbH;Gehalt\n\
        kein datum;-5,00;Bäcker;\n";

    fn setup() -> (TempDir, Arc<DuckDbRepository>, ImportService, Source) {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(DuckDbRepository::new(&dir.path().join("test.duckdb")).unwrap());
        repo.ensure_schema().unwrap();
        let service = ImportService::new(repo.clone(), dir.path(), Region::De);
        let source = Source::new("Giro", SourceKind::Csv, "EUR").with_iban("DE89370400440532013000");
        repo.upsert_source(&source).unwrap();
        (dir, repo, service, source)
    }

    fn write_csv(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_sniff_and_bom() {
        let table = read_csv_bytes(GERMAN_CSV.as_bytes()).unwrap();
        assert_eq!(table.delimiter, ';');
        assert_eq!(table.headers[0], "Buchungsdatum");
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[1]["Empfänger"], "Arbeitgeber GmbH");
    }

    #[test]
    fn test_latin1_fallback() {
        let bytes = b"Datum,Empf\xe4nger\n2024-01-01,M\xfcller\n";
        let table = read_csv_bytes(bytes).unwrap();
        assert_eq!(table.headers[1], "Empfänger");
        assert_eq!(table.rows[0]["Empfänger"], "Müller");
    }

    #[test]
    fn test_import_records_row_errors_and_dedupes() {
        let (dir, repo, service, source) = setup();
        let path = write_csv(&dir, "umsatz.csv", GERMAN_CSV);

        let first = service
            .import(&path, &source.id.to_string(), &ImportOptions::default(), None)
            .unwrap();
        assert_eq!(first.counts.total, 3);
        assert_eq!(first.counts.imported, 2);
        assert_eq!(first.counts.errored, 1);
        assert_eq!(first.row_errors[0].row, 3);
        assert_eq!(first.row_errors[0].raw["Empfänger"], "Bäcker");
        assert!(first.counts.is_balanced());

        let second = service.import(&path, "Giro", &ImportOptions::default(), None).unwrap();
        assert_eq!(second.counts.imported, 0);
        assert_eq!(second.counts.skipped, 2);
        assert!(second.counts.is_balanced());

        let stored = repo.get_transactions_by_source(source.id).unwrap();
        assert_eq!(stored.len(), 2);
        let salary = stored.iter().find(|t| t.amount == 250_000).unwrap();
        assert_eq!(salary.counterparty_name.as_deref(), Some("Arbeitgeber GmbH"));
        assert_eq!(salary.reference.as_deref(), Some("Gehalt"));

        // Mappings were saved on the source and the raw file kept
        let reloaded = repo.get_source(source.id).unwrap().unwrap();
        assert!(reloaded.field_mappings.is_some());
        let record = repo.get_import_record(first.import_id.unwrap()).unwrap().unwrap();
        assert!(Path::new(&record.raw_file_path).exists());
        assert_eq!(record.row_errors.len(), 1);
    }

    #[test]
    fn test_validation_blocks_import() {
        let (dir, repo, service, source) = setup();
        let path = write_csv(&dir, "bad.csv", "Foo,Bar\nx,y\n");

        let err = service
            .import(&path, &source.id.to_string(), &ImportOptions::default(), None)
            .unwrap_err();
        match err {
            Error::Validation { missing } => {
                assert_eq!(missing, vec!["date", "amount", "name|partner"])
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(repo.transaction_count(source.id).unwrap(), 0);
        assert!(repo.list_import_records(Some(source.id)).unwrap().is_empty());
    }

    #[test]
    fn test_preview_does_not_write() {
        let (dir, repo, service, source) = setup();
        let path = write_csv(&dir, "umsatz.csv", GERMAN_CSV);
        let options = ImportOptions {
            preview: true,
            ..Default::default()
        };

        let result = service.import(&path, "Giro", &options, None).unwrap();
        assert!(result.preview);
        assert!(result.import_id.is_none());
        assert_eq!(result.counts.imported, 2);
        assert_eq!(repo.transaction_count(source.id).unwrap(), 0);
    }

    #[test]
    fn test_remap_uses_stored_file() {
        let (dir, repo, service, source) = setup();
        let csv = "Datum,Betrag,Name\n01/02/2024,10.00,Shop\n";
        let path = write_csv(&dir, "us.csv", csv);

        // Ambiguous slashes resolve to the US preset; remap as day-first
        let first = service.import(&path, "Giro", &ImportOptions::default(), None).unwrap();
        fs::remove_file(&path).unwrap();

        let mappings = vec![
            FieldMapping::manual("Datum", CanonicalField::Date, Some("eu-slash".to_string())),
            FieldMapping::manual("Betrag", CanonicalField::Amount, Some("en".to_string())),
            FieldMapping::manual("Name", CanonicalField::Name, None),
        ];
        let remapped = service
            .remap(first.import_id.unwrap(), mappings, &ImportOptions::default(), None)
            .unwrap();
        assert_eq!(remapped.counts.imported, 1);

        let records = repo.list_import_records(Some(source.id)).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.remapped_from == first.import_id));

        let live = repo.get_transactions_by_source(source.id).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].date.to_string(), "2024-02-01");
        assert_eq!(live[0].import_job_id, remapped.import_id);
    }

    #[test]
    fn test_repeated_remap_keeps_one_live_row_per_line() {
        let (dir, repo, service, source) = setup();
        let path = write_csv(&dir, "us.csv", "Datum,Betrag,Name\n01/02/2024,10.00,Shop\n03/04/2024,-2.50,Kiosk\n");
        let first = service.import(&path, "Giro", &ImportOptions::default(), None).unwrap();
        assert_eq!(first.counts.imported, 2);

        let day_first = vec![
            FieldMapping::manual("Datum", CanonicalField::Date, Some("eu-slash".to_string())),
            FieldMapping::manual("Betrag", CanonicalField::Amount, Some("en".to_string())),
            FieldMapping::manual("Name", CanonicalField::Name, None),
        ];
        let second = service
            .remap(first.import_id.unwrap(), day_first.clone(), &ImportOptions::default(), None)
            .unwrap();
        // Remapping the original again replaces the second run's rows too
        let third = service
            .remap(first.import_id.unwrap(), day_first, &ImportOptions::default(), None)
            .unwrap();
        assert_eq!(second.counts.imported, 2);
        assert_eq!(third.counts.imported, 2);
        assert_eq!(third.counts.skipped, 0);

        let live = repo.get_transactions_by_source(source.id).unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|t| t.import_job_id == third.import_id));
        let mut dates: Vec<_> = live.iter().map(|t| t.date.to_string()).collect();
        dates.sort();
        assert_eq!(dates, vec!["2024-02-01", "2024-04-03"]);
    }

    #[test]
    fn test_failed_file_copy_leaves_nothing_behind() {
        let (dir, repo, service, source) = setup();
        let path = write_csv(&dir, "umsatz.csv", GERMAN_CSV);
        // A plain file where the imports directory should go
        fs::write(dir.path().join("imports"), b"").unwrap();

        assert!(service.import(&path, "Giro", &ImportOptions::default(), None).is_err());
        assert_eq!(repo.transaction_count(source.id).unwrap(), 0);
        assert!(repo.list_import_records(Some(source.id)).unwrap().is_empty());
    }

    #[test]
    fn test_import_record_written_with_final_counts() {
        let (dir, repo, service, source) = setup();
        let path = write_csv(&dir, "umsatz.csv", GERMAN_CSV);

        let result = service.import(&path, "Giro", &ImportOptions::default(), None).unwrap();
        let records = repo.list_import_records(Some(source.id)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, result.import_id.unwrap());
        assert_eq!(records[0].counts, result.counts);
        assert_eq!(records[0].date_from, result.date_from);
        assert_eq!(records[0].date_to, NaiveDate::from_ymd_opt(2024, 3, 16));

        let stored = repo.get_transactions_by_source(source.id).unwrap();
        assert!(stored.iter().all(|t| t.import_job_id == result.import_id));
    }
}
