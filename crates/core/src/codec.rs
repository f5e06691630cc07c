//! Binary change stream codec.
//!
//! The layout follows the storage engine's session format: a table header
//! (`'T'` for changesets, `'P'` for patchsets) followed by change records for
//! that table, each an opcode byte, an indirect byte and one or two value
//! records. A stream may end with an `'F'` trailer carrying the number of
//! foreign-key violations observed by the producer.

use crate::change::{ChangeRecord, DbOpcode};
use crate::error::CoreError;
use crate::value::ColumnValue;

const TABLE_CHANGESET: u8 = b'T';
const TABLE_PATCHSET: u8 = b'P';
const FK_TRAILER: u8 = b'F';

const VALUE_UNDEFINED: u8 = 0;
const VALUE_INTEGER: u8 = 1;
const VALUE_REAL: u8 = 2;
const VALUE_TEXT: u8 = 3;
const VALUE_BLOB: u8 = 4;
const VALUE_NULL: u8 = 5;

/// Signature written in front of every saved local txn blob.
pub const TXN_BLOB_SIGNATURE: u32 = 0x0600;
const TXN_BLOB_HEADER_LEN: usize = 8;

// ============================================================================
// Varints
// ============================================================================

pub fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    if v & (0xff00_0000_u64 << 32) != 0 {
        let mut buf = [0u8; 9];
        buf[8] = v as u8;
        v >>= 8;
        for slot in buf[..8].iter_mut().rev() {
            *slot = ((v & 0x7f) | 0x80) as u8;
            v >>= 7;
        }
        out.extend_from_slice(&buf);
        return;
    }

    let mut buf = [0u8; 10];
    let mut n = 0;
    loop {
        buf[n] = ((v & 0x7f) | 0x80) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    buf[0] &= 0x7f;
    out.extend(buf[..n].iter().rev());
}

/// Returns the value and the number of bytes consumed, or `None` when the
/// input ends inside the varint.
pub fn get_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut v: u64 = 0;
    for i in 0..8 {
        let b = *data.get(i)?;
        v = (v << 7) | u64::from(b & 0x7f);
        if b & 0x80 == 0 {
            return Some((v, i + 1));
        }
    }
    let b = *data.get(8)?;
    Some(((v << 8) | u64::from(b), 9))
}

// ============================================================================
// Writer
// ============================================================================

struct TableHeader {
    table: String,
    pk_columns: Vec<bool>,
    patchset: bool,
}

/// Serializes change records into a change stream.
pub struct ChangesetWriter {
    buf: Vec<u8>,
    current: Option<TableHeader>,
    patchset: bool,
    fk_violations: Option<u64>,
}

impl ChangesetWriter {
    pub fn changeset() -> Self {
        Self {
            buf: Vec::new(),
            current: None,
            patchset: false,
            fk_violations: None,
        }
    }

    pub fn patchset() -> Self {
        Self {
            patchset: true,
            ..Self::changeset()
        }
    }

    pub fn set_fk_violations(&mut self, count: u64) {
        self.fk_violations = Some(count);
    }

    pub fn write(&mut self, record: &ChangeRecord) -> Result<(), CoreError> {
        record
            .validate()
            .map_err(|e| CoreError::Encode(e.to_string()))?;

        let same_table = self
            .current
            .as_ref()
            .is_some_and(|h| h.table == record.table && h.pk_columns == record.pk_columns);
        if !same_table {
            if record.table.as_bytes().contains(&0) {
                return Err(CoreError::Encode(format!(
                    "table name {:?} contains NUL",
                    record.table
                )));
            }
            self.buf.push(if self.patchset {
                TABLE_PATCHSET
            } else {
                TABLE_CHANGESET
            });
            put_varint(&mut self.buf, record.column_count() as u64);
            self.buf
                .extend(record.pk_columns.iter().map(|pk| u8::from(*pk)));
            self.buf.extend_from_slice(record.table.as_bytes());
            self.buf.push(0);
            self.current = Some(TableHeader {
                table: record.table.clone(),
                pk_columns: record.pk_columns.clone(),
                patchset: self.patchset,
            });
        }

        self.buf.push(record.opcode.code());
        self.buf.push(u8::from(record.indirect));

        let patchset = self.patchset;
        match record.opcode {
            DbOpcode::Insert => self.write_values(&record.new, None),
            DbOpcode::Delete => {
                let keys_only = patchset.then_some(record.pk_columns.as_slice());
                self.write_values(&record.old, keys_only);
            }
            DbOpcode::Update => {
                let keys_only = patchset.then_some(record.pk_columns.as_slice());
                self.write_values(&record.old, keys_only);
                self.write_values(&record.new, None);
            }
        }
        Ok(())
    }

    fn write_values(&mut self, values: &[Option<ColumnValue>], keys_only: Option<&[bool]>) {
        for (i, value) in values.iter().enumerate() {
            if let Some(pk) = keys_only
                && !pk[i]
            {
                continue;
            }
            encode_value(&mut self.buf, value.as_ref());
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if let Some(count) = self.fk_violations {
            self.buf.push(FK_TRAILER);
            put_varint(&mut self.buf, count);
        }
        self.buf
    }
}

/// Encode a full changeset from records.
pub fn encode_changeset(records: &[ChangeRecord]) -> Result<Vec<u8>, CoreError> {
    let mut writer = ChangesetWriter::changeset();
    for record in records {
        writer.write(record)?;
    }
    Ok(writer.finish())
}

fn encode_value(out: &mut Vec<u8>, value: Option<&ColumnValue>) {
    match value {
        None => out.push(VALUE_UNDEFINED),
        Some(ColumnValue::Null) => out.push(VALUE_NULL),
        Some(ColumnValue::Integer(v)) => {
            out.push(VALUE_INTEGER);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Some(ColumnValue::Real(v)) => {
            out.push(VALUE_REAL);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Some(ColumnValue::Text(s)) => {
            out.push(VALUE_TEXT);
            put_varint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Some(ColumnValue::Blob(b)) => {
            out.push(VALUE_BLOB);
            put_varint(out, b.len() as u64);
            out.extend_from_slice(b);
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Lazy decoder over a change stream.
///
/// Yields one `ChangeRecord` per change; a decode failure is yielded once and
/// ends the iteration. `reset` rewinds to the start of the stream.
pub struct ChangeReader<'a> {
    data: &'a [u8],
    pos: usize,
    header: Option<TableHeader>,
    fk_violations: u64,
    finished: bool,
}

impl<'a> ChangeReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            header: None,
            fk_violations: 0,
            finished: false,
        }
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.header = None;
        self.fk_violations = 0;
        self.finished = false;
    }

    /// Foreign-key violation count carried by the stream trailer. Only
    /// meaningful once the stream has been read to the end.
    pub fn fk_violations(&self) -> u64 {
        self.fk_violations
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn byte(&mut self, what: &str) -> Result<u8, CoreError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| CoreError::decode(self.pos, format!("truncated {what}")))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self, what: &str) -> Result<u64, CoreError> {
        let (v, n) = get_varint(&self.data[self.pos..])
            .ok_or_else(|| CoreError::decode(self.pos, format!("truncated {what}")))?;
        self.pos += n;
        Ok(v)
    }

    fn bytes(&mut self, len: u64, what: &str) -> Result<&'a [u8], CoreError> {
        let data = self.data;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| self.pos.checked_add(len))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| CoreError::decode(self.pos, format!("truncated {what}")))?;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_table_header(&mut self, patchset: bool) -> Result<(), CoreError> {
        let n_col = self.varint("column count")?;
        if n_col == 0 {
            return Err(CoreError::decode(self.pos, "table header with zero columns"));
        }
        let flags = self.bytes(n_col, "primary key flags")?;
        let pk_columns: Vec<bool> = flags.iter().map(|b| *b != 0).collect();

        let start = self.pos;
        let rest = &self.data[start..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| CoreError::decode(start, "unterminated table name"))?;
        let table = std::str::from_utf8(&rest[..nul])
            .map_err(|_| CoreError::decode(start, "table name is not valid UTF-8"))?
            .to_string();
        self.pos = start + nul + 1;

        self.header = Some(TableHeader {
            table,
            pk_columns,
            patchset,
        });
        Ok(())
    }

    fn read_value(&mut self) -> Result<Option<ColumnValue>, CoreError> {
        let at = self.pos;
        let tag = self.byte("value type")?;
        match tag {
            VALUE_UNDEFINED => Ok(None),
            VALUE_NULL => Ok(Some(ColumnValue::Null)),
            VALUE_INTEGER => {
                let raw = self.bytes(8, "integer value")?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok(Some(ColumnValue::Integer(i64::from_be_bytes(buf))))
            }
            VALUE_REAL => {
                let raw = self.bytes(8, "real value")?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok(Some(ColumnValue::Real(f64::from_bits(u64::from_be_bytes(buf)))))
            }
            VALUE_TEXT => {
                let len = self.varint("text length")?;
                let raw = self.bytes(len, "text value")?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| CoreError::decode(at, "text value is not valid UTF-8"))?;
                Ok(Some(ColumnValue::Text(text.to_string())))
            }
            VALUE_BLOB => {
                let len = self.varint("blob length")?;
                let raw = self.bytes(len, "blob value")?;
                Ok(Some(ColumnValue::Blob(raw.to_vec())))
            }
            other => Err(CoreError::decode(at, format!("unknown value type {other}"))),
        }
    }

    fn read_values(
        &mut self,
        pk_columns: &[bool],
        keys_only: bool,
    ) -> Result<Vec<Option<ColumnValue>>, CoreError> {
        let mut values = Vec::with_capacity(pk_columns.len());
        for is_pk in pk_columns {
            if keys_only && !is_pk {
                values.push(None);
            } else {
                values.push(self.read_value()?);
            }
        }
        Ok(values)
    }

    fn read_change(&mut self, code: u8, at: usize) -> Result<ChangeRecord, CoreError> {
        let opcode = DbOpcode::from_code(code)
            .ok_or_else(|| CoreError::decode(at, format!("unrecognized header byte 0x{code:02x}")))?;
        let (table, pk_columns, patchset) = match &self.header {
            Some(h) => (h.table.clone(), h.pk_columns.clone(), h.patchset),
            None => return Err(CoreError::decode(at, "change record before table header")),
        };
        let indirect = self.byte("indirect flag")? != 0;

        let (old, new) = match opcode {
            DbOpcode::Insert => (Vec::new(), self.read_values(&pk_columns, false)?),
            DbOpcode::Delete => (self.read_values(&pk_columns, patchset)?, Vec::new()),
            DbOpcode::Update => {
                let old = self.read_values(&pk_columns, patchset)?;
                let new = self.read_values(&pk_columns, false)?;
                (old, new)
            }
        };

        let record = ChangeRecord {
            table,
            opcode,
            indirect,
            pk_columns,
            old,
            new,
        };
        record
            .validate()
            .map_err(|e| CoreError::decode(at, e.to_string()))?;
        Ok(record)
    }

    fn read_next(&mut self) -> Result<Option<ChangeRecord>, CoreError> {
        loop {
            if self.pos >= self.data.len() {
                return Ok(None);
            }
            let at = self.pos;
            let code = self.byte("record header")?;
            match code {
                TABLE_CHANGESET => self.read_table_header(false)?,
                TABLE_PATCHSET => self.read_table_header(true)?,
                FK_TRAILER => {
                    self.fk_violations = self.varint("foreign key trailer")?;
                    if self.pos != self.data.len() {
                        return Err(CoreError::decode(
                            self.pos,
                            "data after foreign key trailer",
                        ));
                    }
                    return Ok(None);
                }
                other => return self.read_change(other, at).map(Some),
            }
        }
    }
}

impl Iterator for ChangeReader<'_> {
    type Item = Result<ChangeRecord, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode a whole stream eagerly.
pub fn decode_changeset(data: &[u8]) -> Result<Vec<ChangeRecord>, CoreError> {
    ChangeReader::new(data).collect()
}

// ============================================================================
// Saved txn envelope
// ============================================================================

pub fn wrap_txn_blob(changeset: &[u8]) -> Result<Vec<u8>, CoreError> {
    let size = u32::try_from(changeset.len())
        .map_err(|_| CoreError::Encode(format!("txn of {} bytes is too large", changeset.len())))?;
    let mut out = Vec::with_capacity(TXN_BLOB_HEADER_LEN + changeset.len());
    out.extend_from_slice(&TXN_BLOB_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(changeset);
    Ok(out)
}

pub fn unwrap_txn_blob(blob: &[u8]) -> Result<&[u8], CoreError> {
    if blob.len() < TXN_BLOB_HEADER_LEN {
        return Err(CoreError::decode(0, "truncated txn header"));
    }
    let signature = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    if signature != TXN_BLOB_SIGNATURE {
        return Err(CoreError::decode(
            0,
            format!("unrecognized txn signature 0x{signature:04x}"),
        ));
    }
    let size = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
    let payload = &blob[TXN_BLOB_HEADER_LEN..];
    if payload.len() != size {
        return Err(CoreError::decode(
            4,
            format!("txn header says {size} bytes, found {}", payload.len()),
        ));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget_insert(id: i64, name: &str) -> ChangeRecord {
        ChangeRecord::insert(
            "app_Widget",
            vec![true, false, false],
            vec![id.into(), name.into(), ColumnValue::Null],
        )
    }

    #[test]
    fn varint_boundaries() {
        for v in [0u64, 0x7f, 0x80, 0x3fff, 0x4000, u64::from(u32::MAX), 1 << 56, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            assert!(buf.len() <= 9);
            assert_eq!(get_varint(&buf), Some((v, buf.len())), "value {v:#x}");
        }
        assert_eq!(get_varint(&[0x81]), None);
    }

    #[test]
    fn table_header_written_once_per_run() {
        let records = vec![widget_insert(1, "a"), widget_insert(2, "b")];
        let bytes = encode_changeset(&records).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == TABLE_CHANGESET).count(), 1);
        assert_eq!(bytes[0], TABLE_CHANGESET);
        assert_eq!(decode_changeset(&bytes).unwrap(), records);
    }

    #[test]
    fn mixed_stream_decodes_in_order() {
        let update = ChangeRecord::update(
            "app_Widget",
            vec![true, false, false],
            vec![1.into(), "a".into(), ColumnValue::Null],
            vec![1.into(), "a".into(), ColumnValue::Real(2.5)],
        );
        let delete = ChangeRecord::delete(
            "ec_Class",
            vec![true, false],
            vec![9.into(), ColumnValue::Blob(vec![1, 2, 3])],
        )
        .with_indirect(true);
        let records = vec![widget_insert(1, "a"), update, delete];
        let decoded = decode_changeset(&encode_changeset(&records).unwrap()).unwrap();
        assert_eq!(decoded, records);
        assert!(decoded[2].indirect);
    }

    #[test]
    fn patchset_keeps_only_keys_on_old_side() {
        let mut writer = ChangesetWriter::patchset();
        writer
            .write(&ChangeRecord::delete(
                "app_Widget",
                vec![true, false, false],
                vec![4.into(), "gone".into(), 3.into()],
            ))
            .unwrap();
        let bytes = writer.finish();
        assert_eq!(bytes[0], TABLE_PATCHSET);

        let decoded = decode_changeset(&bytes).unwrap();
        assert_eq!(decoded[0].old_value(0), Some(&ColumnValue::Integer(4)));
        assert_eq!(decoded[0].old_value(1), None);
        assert!(decoded[0].is_patch());
    }

    #[test]
    fn trailer_reports_fk_violations() {
        let mut writer = ChangesetWriter::changeset();
        writer.write(&widget_insert(1, "a")).unwrap();
        writer.set_fk_violations(7);
        let bytes = writer.finish();

        let mut reader = ChangeReader::new(&bytes);
        assert_eq!(reader.by_ref().count(), 1);
        assert_eq!(reader.fk_violations(), 7);

        reader.reset();
        assert_eq!(reader.fk_violations(), 0);
        assert_eq!(reader.by_ref().filter_map(Result::ok).count(), 1);
        assert_eq!(reader.fk_violations(), 7);
    }

    #[test]
    fn truncated_stream_is_decode_error() {
        let bytes = encode_changeset(&[widget_insert(1, "abcdef")]).unwrap();
        let cut = &bytes[..bytes.len() - 3];
        let mut reader = ChangeReader::new(cut);
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.is_decode());
        assert!(reader.next().is_none());
    }

    #[test]
    fn unknown_header_is_decode_error() {
        let err = decode_changeset(&[0x42, 0x01]).unwrap_err();
        assert!(err.to_string().contains("unrecognized header byte 0x42"));

        let err = decode_changeset(&[DbOpcode::INSERT_CODE, 0]).unwrap_err();
        assert!(err.to_string().contains("before table header"));
    }

    #[test]
    fn data_after_trailer_is_rejected() {
        let mut bytes = encode_changeset(&[widget_insert(1, "a")]).unwrap();
        bytes.extend_from_slice(&[FK_TRAILER, 2, TABLE_CHANGESET]);
        assert!(decode_changeset(&bytes).is_err());
    }

    #[test]
    fn empty_stream_has_no_records() {
        assert!(decode_changeset(&[]).unwrap().is_empty());
    }

    #[test]
    fn txn_envelope_checks_signature_and_size() {
        let body = encode_changeset(&[widget_insert(1, "a")]).unwrap();
        let wrapped = wrap_txn_blob(&body).unwrap();
        assert_eq!(unwrap_txn_blob(&wrapped).unwrap(), body.as_slice());

        let mut bad = wrapped.clone();
        bad[0] = 0x07;
        assert!(unwrap_txn_blob(&bad).unwrap_err().is_decode());

        assert!(unwrap_txn_blob(&wrapped[..wrapped.len() - 1]).is_err());
    }
}
