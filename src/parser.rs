// Row-streaming tabular parser. XLSX and CSV sources are both driven cell by
// cell into a RowAssembler, which holds one fixed-width row at a time. Row 0
// is the header and is skipped. Cells past the configured width are dropped.

use std::io::{Read, Seek, SeekFrom};

use calamine::{DataRef, Reader, Xlsx};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Result, TallyError};
use crate::models::TransactionRecord;

/// Textual timestamp layout, e.g. `2025-01-10T12:00:00.000000`, read as UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

// ---------------------------------------------------------------------------
// Coercions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Text,
    Decimal,
    Integer,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Decimal(f64),
    Integer(i64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Coercion {
    pub fn apply(self, raw: &str) -> std::result::Result<CellValue, String> {
        let raw = raw.trim();
        match self {
            Coercion::Text => Ok(CellValue::Text(raw.to_string())),
            Coercion::Decimal => raw
                .parse::<f64>()
                .map(CellValue::Decimal)
                .map_err(|_| format!("'{raw}' is not a decimal")),
            Coercion::Integer => raw
                .parse::<i64>()
                .map(CellValue::Integer)
                .map_err(|_| format!("'{raw}' is not an integer")),
            Coercion::Date => parse_date(raw)
                .map(CellValue::Date)
                .ok_or_else(|| format!("'{raw}' is neither a YYYY-MM-DD date nor a serial date")),
            Coercion::Timestamp => parse_timestamp(raw)
                .map(CellValue::Timestamp)
                .ok_or_else(|| format!("'{raw}' is neither a timestamp nor a serial date")),
        }
    }
}

/// Parses the textual timestamp layout, falling back to a spreadsheet serial
/// date number when the text does not match.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
        return Some(dt.and_utc());
    }
    let serial: f64 = raw.parse().ok()?;
    excel_serial_to_timestamp(serial)
}

/// Parses a `YYYY-MM-DD` date, falling back to the calendar day of a
/// spreadsheet serial.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    let serial: f64 = raw.parse().ok()?;
    excel_serial_to_timestamp(serial).map(|t| t.date_naive())
}

/// Converts an Excel 1900-system serial (days since 1899-12-30, fraction is the
/// time of day) to a UTC instant, rounded to the millisecond.
pub fn excel_serial_to_timestamp(serial: f64) -> Option<DateTime<Utc>> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    // 1899-12-30 absorbs the 1900 leap year bug for serials from March 1900 on.
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    let dt = base.checked_add_signed(Duration::milliseconds(millis))?;
    Some(dt.and_utc())
}

// ---------------------------------------------------------------------------
// Column layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    TxnDate,
    TransactionId,
    AccountNumber,
    CustomerName,
    MerchantName,
    Amount,
    Currency,
    PaymentMethod,
    Status,
    Category,
    SubCategory,
    Country,
    City,
    Channel,
    RewardPoints,
    SettlementDate,
    Remarks,
}

impl Field {
    fn text_slot(self, record: &mut TransactionRecord) -> Option<&mut Option<String>> {
        Some(match self {
            Field::TransactionId => &mut record.transaction_id,
            Field::AccountNumber => &mut record.account_number,
            Field::CustomerName => &mut record.customer_name,
            Field::MerchantName => &mut record.merchant_name,
            Field::Currency => &mut record.currency,
            Field::PaymentMethod => &mut record.payment_method,
            Field::Status => &mut record.status,
            Field::Category => &mut record.category,
            Field::SubCategory => &mut record.sub_category,
            Field::Country => &mut record.country,
            Field::City => &mut record.city,
            Field::Channel => &mut record.channel,
            Field::Remarks => &mut record.remarks,
            Field::TxnDate | Field::Amount | Field::RewardPoints | Field::SettlementDate => {
                return None
            }
        })
    }

    fn assign(self, record: &mut TransactionRecord, value: CellValue) -> std::result::Result<(), String> {
        match (self, value) {
            (Field::TxnDate, CellValue::Timestamp(t)) => record.txn_date = Some(t),
            (Field::Amount, CellValue::Decimal(v)) => record.amount = Some(v),
            (Field::Amount, CellValue::Integer(v)) => record.amount = Some(v as f64),
            (Field::RewardPoints, CellValue::Integer(v)) => record.reward_points = Some(v),
            (Field::SettlementDate, CellValue::Date(d)) => record.settlement_date = Some(d),
            (field, CellValue::Text(s)) => match field.text_slot(record) {
                Some(slot) => *slot = Some(s),
                None => return Err(format!("{field:?} cannot hold text")),
            },
            (field, value) => return Err(format!("{field:?} cannot hold {value:?}")),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub index: usize,
    pub field: Field,
    pub coercion: Coercion,
}

/// Ordered (column index → field, coercion) pairs. The row buffer is as wide
/// as the highest mapped index.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    columns: Vec<ColumnSpec>,
    width: usize,
}

impl ColumnMap {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        let width = columns.iter().map(|c| c.index + 1).max().unwrap_or(0);
        Self { columns, width }
    }

    /// The 17-column transaction export layout.
    pub fn transactions() -> Self {
        use Coercion::*;
        use Field::*;
        let layout = [
            (TxnDate, Timestamp),
            (TransactionId, Text),
            (AccountNumber, Text),
            (CustomerName, Text),
            (MerchantName, Text),
            (Amount, Decimal),
            (Currency, Text),
            (PaymentMethod, Text),
            (Status, Text),
            (Category, Text),
            (SubCategory, Text),
            (Country, Text),
            (City, Text),
            (Channel, Text),
            (RewardPoints, Integer),
            (SettlementDate, Date),
            (Remarks, Text),
        ];
        Self::new(
            layout
                .iter()
                .enumerate()
                .map(|(index, &(field, coercion))| ColumnSpec { index, field, coercion })
                .collect(),
        )
    }

    pub fn width(&self) -> usize {
        self.width
    }

    fn build(&self, cells: &[Option<String>]) -> std::result::Result<TransactionRecord, String> {
        let mut record = TransactionRecord::default();
        for spec in &self.columns {
            let Some(raw) = cells.get(spec.index).and_then(|c| c.as_deref()) else {
                continue;
            };
            let value = spec
                .coercion
                .apply(raw)
                .map_err(|e| format!("column {}: {e}", spec.index))?;
            spec.field
                .assign(&mut record, value)
                .map_err(|e| format!("column {}: {e}", spec.index))?;
        }
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Row assembly
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub rows_parsed: usize,
    pub rows_skipped: usize,
}

/// Collects the cells of one row at a time and emits a record when the row
/// ends. Coercion failures skip the row; callback errors abort the parse.
pub struct RowAssembler<'c, F> {
    columns: &'c ColumnMap,
    buffer: Vec<Option<String>>,
    row: Option<u32>,
    on_row: F,
    summary: ParseSummary,
}

impl<'c, F> RowAssembler<'c, F>
where
    F: FnMut(TransactionRecord) -> Result<()>,
{
    pub fn new(columns: &'c ColumnMap, on_row: F) -> Self {
        Self {
            columns,
            buffer: vec![None; columns.width()],
            row: None,
            on_row,
            summary: ParseSummary::default(),
        }
    }

    /// Feeds one cell. A change of row index closes the previous row.
    pub fn cell(&mut self, row: u32, col: usize, value: Option<String>) -> Result<()> {
        if self.row != Some(row) {
            self.end_row()?;
            self.row = Some(row);
        }
        if row == 0 {
            return Ok(());
        }
        if let Some(slot) = self.buffer.get_mut(col) {
            *slot = value.filter(|v| !v.trim().is_empty());
        }
        Ok(())
    }

    pub fn end_row(&mut self) -> Result<()> {
        let Some(row) = self.row.take() else {
            return Ok(());
        };
        // Reset before building so a failed row cannot leak into the next.
        let cells = std::mem::replace(&mut self.buffer, vec![None; self.columns.width()]);
        if row == 0 {
            return Ok(());
        }
        match self.columns.build(&cells) {
            Ok(record) => {
                self.summary.rows_parsed += 1;
                (self.on_row)(record)
            }
            Err(message) => {
                let err = TallyError::RowParse { row, message };
                tracing::warn!(error = %err, "skipping unparseable row");
                self.summary.rows_skipped += 1;
                Ok(())
            }
        }
    }

    pub fn finish(mut self) -> Result<ParseSummary> {
        self.end_row()?;
        Ok(self.summary)
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Xlsx,
    Csv,
}

impl SourceFormat {
    /// Sniffs the first bytes and rewinds the reader.
    pub fn detect<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        let mut filled = 0;
        while filled < magic.len() {
            let n = reader.read(&mut magic[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        reader.seek(SeekFrom::Start(0))?;
        if filled == magic.len() && magic == ZIP_MAGIC {
            Ok(SourceFormat::Xlsx)
        } else {
            Ok(SourceFormat::Csv)
        }
    }
}

pub struct TabularParser {
    columns: ColumnMap,
}

impl Default for TabularParser {
    fn default() -> Self {
        Self::new(ColumnMap::transactions())
    }
}

impl TabularParser {
    pub fn new(columns: ColumnMap) -> Self {
        Self { columns }
    }

    /// Streams every data row of the first sheet into `on_row`.
    pub fn parse<R, F>(&self, mut reader: R, on_row: F) -> Result<ParseSummary>
    where
        R: Read + Seek,
        F: FnMut(TransactionRecord) -> Result<()>,
    {
        let format = SourceFormat::detect(&mut reader)?;
        tracing::debug!(?format, "parsing upload");
        let mut assembler = RowAssembler::new(&self.columns, on_row);
        match format {
            SourceFormat::Xlsx => read_xlsx(reader, &mut assembler)?,
            SourceFormat::Csv => read_csv(reader, &mut assembler)?,
        }
        assembler.finish()
    }
}

fn read_xlsx<R, F>(reader: R, assembler: &mut RowAssembler<'_, F>) -> Result<()>
where
    R: Read + Seek,
    F: FnMut(TransactionRecord) -> Result<()>,
{
    let mut workbook: Xlsx<R> = Xlsx::new(reader)?;
    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        tracing::warn!("workbook has no sheets");
        return Ok(());
    };
    let mut cells = workbook.worksheet_cells_reader(&sheet)?;
    while let Some(cell) = cells.next_cell()? {
        let (row, col) = cell.get_position();
        assembler.cell(row, col as usize, cell_text(cell.get_value()))?;
    }
    Ok(())
}

fn cell_text(value: &DataRef<'_>) -> Option<String> {
    match value {
        DataRef::Empty => None,
        DataRef::String(s) => Some(s.clone()),
        DataRef::SharedString(s) => Some(s.to_string()),
        DataRef::Float(f) => Some(f.to_string()),
        DataRef::Int(i) => Some(i.to_string()),
        DataRef::Bool(b) => Some(b.to_string()),
        // Date-styled numeric cells; the date coercions read the serial.
        DataRef::DateTime(dt) => Some(dt.as_f64().to_string()),
        DataRef::DateTimeIso(s) | DataRef::DurationIso(s) => Some(s.clone()),
        _ => None,
    }
}

fn read_csv<R, F>(reader: R, assembler: &mut RowAssembler<'_, F>) -> Result<()>
where
    R: Read,
    F: FnMut(TransactionRecord) -> Result<()>,
{
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(std::io::BufReader::new(reader));
    for (row, result) in rdr.records().enumerate() {
        let row = row as u32;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(row, error = %e, "skipping unreadable CSV record");
                continue;
            }
        };
        for (col, field) in record.iter().enumerate() {
            assembler.cell(row, col, Some(field.to_string()))?;
        }
        assembler.end_row()?;
    }
    Ok(())
}
