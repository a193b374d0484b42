//! Schema-aware mutation-group serialization and partition-key encoding.
//!
//! Keys are encoded so that byte-lexicographic order over the encoded form
//! matches the store's native primary-key order, which lets the sampler and
//! partitioner work on opaque byte strings. Group payloads use a compact
//! version-tagged binary layout that survives the shuffle between pipeline
//! stages losslessly.

use crate::error::{Result, SinkError};
use crate::mutation::{KeyRange, KeySet, Mutation, MutationGroup, Value, WriteKind};
use crate::schema::{
    normalize_table_name, ColumnDescriptor, ColumnType, StoreSchema, TableDescriptor,
};

/// Format version for serialized group payloads.
const GROUP_FORMAT_VERSION: u8 = 1;

/// Key-part marker for an explicit null value.
const KEY_NULL_MARKER: u8 = 0x00;
/// Key-part marker preceding a non-null payload.
const KEY_NOT_NULL_MARKER: u8 = 0x01;
/// Flips the sign bit so two's-complement integers sort unsigned.
const SIGN_FLIP_MASK: u64 = 1u64 << 63;

const OP_INSERT: u8 = 0x01;
const OP_UPDATE: u8 = 0x02;
const OP_INSERT_OR_UPDATE: u8 = 0x03;
const OP_REPLACE: u8 = 0x04;
const OP_DELETE: u8 = 0x05;

const VALUE_NULL: u8 = 0x00;
const VALUE_BOOL: u8 = 0x01;
const VALUE_INT64: u8 = 0x02;
const VALUE_FLOAT64: u8 = 0x03;
const VALUE_UTF8: u8 = 0x04;
const VALUE_BYTES: u8 = 0x05;
const VALUE_TIMESTAMP: u8 = 0x06;

const RANGE_FLAG_START_CLOSED: u8 = 0x01;
const RANGE_FLAG_END_CLOSED: u8 = 0x02;

/// One mutation group in pipeline wire form: normalized table of the
/// primary mutation, its encoded partition key (empty when the group is
/// ungroupable), and the serialized group payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedGroup {
    pub table: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl SerializedGroup {
    /// Range and multi-key deletes produce no key; such groups cannot be
    /// safely co-located with anything else.
    pub fn is_ungroupable(&self) -> bool {
        self.key.is_empty()
    }
}

/// Serializes a group into its pipeline wire form.
pub fn serialize_group(schema: &StoreSchema, group: &MutationGroup) -> Result<SerializedGroup> {
    let key = encode_key(schema, group.primary())?.unwrap_or_default();
    let payload = encode_group(schema, group)?;
    Ok(SerializedGroup {
        table: normalize_table_name(group.primary().table()),
        key,
        payload,
    })
}

/// Derives the order-preserving partition key for one mutation.
///
/// Writes encode the key-column values in schema key order. A point delete
/// encodes its single key identically, so a write and a point delete of the
/// same row land in the same partition. Range and multi-key deletes have no
/// derivable key and return `None`.
pub fn encode_key(schema: &StoreSchema, mutation: &Mutation) -> Result<Option<Vec<u8>>> {
    let table = schema.require_table(mutation.table())?;
    match mutation {
        Mutation::Write { columns, .. } => {
            let mut out = Vec::new();
            for part in &table.key_parts {
                let column = table.column(&part.column).ok_or_else(|| {
                    SinkError::schema_mismatch(
                        &table.name,
                        format!("key part references unknown column '{}'", part.column),
                    )
                })?;
                let value = columns
                    .iter()
                    .rev()
                    .find(|(name, _)| name == &part.column)
                    .map(|(_, value)| value)
                    .ok_or_else(|| {
                        SinkError::schema_mismatch(
                            &table.name,
                            format!("write does not assign key column '{}'", part.column),
                        )
                    })?;
                encode_key_part(&mut out, table, column, part.descending, value)?;
            }
            Ok(Some(out))
        }
        Mutation::Delete { key_set, .. } => {
            if !key_set.is_point() {
                return Ok(None);
            }
            let key = &key_set.keys[0];
            if key.len() != table.key_parts.len() {
                return Err(SinkError::schema_mismatch(
                    &table.name,
                    format!(
                        "point delete key has {} values, primary key has {} parts",
                        key.len(),
                        table.key_parts.len()
                    ),
                ));
            }
            let mut out = Vec::new();
            for (part, value) in table.key_parts.iter().zip(key) {
                let column = table.column(&part.column).ok_or_else(|| {
                    SinkError::schema_mismatch(
                        &table.name,
                        format!("key part references unknown column '{}'", part.column),
                    )
                })?;
                encode_key_part(&mut out, table, column, part.descending, value)?;
            }
            Ok(Some(out))
        }
    }
}

/// Appends one key part. Descending parts are encoded ascending first and
/// then bitwise-inverted, which reverses their byte order.
fn encode_key_part(
    out: &mut Vec<u8>,
    table: &TableDescriptor,
    column: &ColumnDescriptor,
    descending: bool,
    value: &Value,
) -> Result<()> {
    let mut part = Vec::new();
    if value.is_null() {
        if !column.nullable {
            return Err(SinkError::schema_mismatch(
                &table.name,
                format!("null value for non-nullable key column '{}'", column.name),
            ));
        }
        part.push(KEY_NULL_MARKER);
    } else {
        check_value_type(table, column, value)?;
        part.push(KEY_NOT_NULL_MARKER);
        match value {
            Value::Bool(v) => part.push(u8::from(*v)),
            Value::Int64(v) | Value::TimestampNanos(v) => {
                part.extend_from_slice(&encode_i64_ordered(*v));
            }
            Value::Float64(v) => part.extend_from_slice(&encode_f64_ordered(*v)),
            Value::Utf8(v) => push_escaped(&mut part, v.as_bytes()),
            Value::Bytes(v) => push_escaped(&mut part, v),
            Value::Null => unreachable!("null handled above"),
        }
    }
    if descending {
        out.extend(part.iter().map(|b| !b));
    } else {
        out.extend_from_slice(&part);
    }
    Ok(())
}

fn encode_i64_ordered(value: i64) -> [u8; 8] {
    (value as u64 ^ SIGN_FLIP_MASK).to_be_bytes()
}

/// IEEE-754 total-order trick: negative floats invert entirely, positive
/// floats flip the sign bit, so encoded bytes sort numerically.
fn encode_f64_ordered(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let ordered = if bits & SIGN_FLIP_MASK != 0 {
        !bits
    } else {
        bits ^ SIGN_FLIP_MASK
    };
    ordered.to_be_bytes()
}

/// Zero-escaped, terminated byte-string encoding. `0x00` becomes
/// `0x00 0xFF` and the part ends with `0x00 0x01`, keeping prefix order
/// intact across multi-part keys.
fn push_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0x00, 0x01]);
}

/// Rejects values whose type disagrees with the column's declared type.
fn check_value_type(table: &TableDescriptor, column: &ColumnDescriptor, value: &Value) -> Result<()> {
    let ok = matches!(
        (column.column_type, value),
        (ColumnType::Bool, Value::Bool(_))
            | (ColumnType::Int64, Value::Int64(_))
            | (ColumnType::Float64, Value::Float64(_))
            | (ColumnType::Utf8, Value::Utf8(_))
            | (ColumnType::Bytes, Value::Bytes(_))
            | (ColumnType::TimestampNanos, Value::TimestampNanos(_))
    );
    if ok || value.is_null() {
        return Ok(());
    }
    Err(SinkError::schema_mismatch(
        &table.name,
        format!(
            "value {value:?} does not match declared type {:?} of column '{}'",
            column.column_type, column.name
        ),
    ))
}

/// Validates one mutation against the schema snapshot.
fn validate_mutation(schema: &StoreSchema, mutation: &Mutation) -> Result<()> {
    let table = schema.require_table(mutation.table())?;
    match mutation {
        Mutation::Write { columns, .. } => {
            for (name, value) in columns {
                let column = table.column(name).ok_or_else(|| {
                    SinkError::schema_mismatch(
                        &table.name,
                        format!("write references unknown column '{name}'"),
                    )
                })?;
                if value.is_null() && !column.nullable {
                    return Err(SinkError::schema_mismatch(
                        &table.name,
                        format!("null value for non-nullable column '{name}'"),
                    ));
                }
                check_value_type(table, column, value)?;
            }
            Ok(())
        }
        Mutation::Delete { key_set, .. } => {
            for key in &key_set.keys {
                validate_key_prefix(table, key, true)?;
            }
            for range in &key_set.ranges {
                validate_key_prefix(table, &range.start, false)?;
                validate_key_prefix(table, &range.end, false)?;
            }
            Ok(())
        }
    }
}

/// Checks key values positionally against the table's key parts. Range
/// endpoints may name a prefix of the key; point keys must be complete.
fn validate_key_prefix(table: &TableDescriptor, values: &[Value], complete: bool) -> Result<()> {
    if complete && values.len() != table.key_parts.len() {
        return Err(SinkError::schema_mismatch(
            &table.name,
            format!(
                "delete key has {} values, primary key has {} parts",
                values.len(),
                table.key_parts.len()
            ),
        ));
    }
    if values.len() > table.key_parts.len() {
        return Err(SinkError::schema_mismatch(
            &table.name,
            format!(
                "key prefix has {} values, primary key has only {} parts",
                values.len(),
                table.key_parts.len()
            ),
        ));
    }
    for (part, value) in table.key_parts.iter().zip(values) {
        let column = table.column(&part.column).ok_or_else(|| {
            SinkError::schema_mismatch(
                &table.name,
                format!("key part references unknown column '{}'", part.column),
            )
        })?;
        if !value.is_null() {
            check_value_type(table, column, value)?;
        }
    }
    Ok(())
}

/// Losslessly serializes a group, validating every mutation against the
/// schema snapshot first.
pub fn encode_group(schema: &StoreSchema, group: &MutationGroup) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.push(GROUP_FORMAT_VERSION);
    out.extend_from_slice(&(group.len() as u32).to_be_bytes());
    for mutation in group.mutations() {
        validate_mutation(schema, mutation)?;
        match mutation {
            Mutation::Write {
                kind,
                table,
                columns,
            } => {
                out.push(match kind {
                    WriteKind::Insert => OP_INSERT,
                    WriteKind::Update => OP_UPDATE,
                    WriteKind::InsertOrUpdate => OP_INSERT_OR_UPDATE,
                    WriteKind::Replace => OP_REPLACE,
                });
                write_str(&mut out, table)?;
                out.extend_from_slice(&(columns.len() as u16).to_be_bytes());
                for (name, value) in columns {
                    write_str(&mut out, name)?;
                    write_value(&mut out, value);
                }
            }
            Mutation::Delete { table, key_set } => {
                out.push(OP_DELETE);
                write_str(&mut out, table)?;
                out.extend_from_slice(&(key_set.keys.len() as u32).to_be_bytes());
                for key in &key_set.keys {
                    write_key_values(&mut out, key);
                }
                out.extend_from_slice(&(key_set.ranges.len() as u32).to_be_bytes());
                for range in &key_set.ranges {
                    let mut flags = 0u8;
                    if range.start_closed {
                        flags |= RANGE_FLAG_START_CLOSED;
                    }
                    if range.end_closed {
                        flags |= RANGE_FLAG_END_CLOSED;
                    }
                    out.push(flags);
                    write_key_values(&mut out, &range.start);
                    write_key_values(&mut out, &range.end);
                }
            }
        }
    }
    Ok(out)
}

/// Decodes a serialized group and re-validates it against the schema.
pub fn decode_group(schema: &StoreSchema, bytes: &[u8]) -> Result<MutationGroup> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8()?;
    if version != GROUP_FORMAT_VERSION {
        return Err(SinkError::Encoding(format!(
            "unsupported group format version {version}"
        )));
    }
    let count = cursor.read_u32()? as usize;
    let mut mutations = Vec::with_capacity(count);
    for _ in 0..count {
        let op = cursor.read_u8()?;
        let table = cursor.read_str()?;
        let mutation = match op {
            OP_INSERT | OP_UPDATE | OP_INSERT_OR_UPDATE | OP_REPLACE => {
                let kind = match op {
                    OP_INSERT => WriteKind::Insert,
                    OP_UPDATE => WriteKind::Update,
                    OP_INSERT_OR_UPDATE => WriteKind::InsertOrUpdate,
                    _ => WriteKind::Replace,
                };
                let column_count = cursor.read_u16()? as usize;
                let mut columns = Vec::with_capacity(column_count);
                for _ in 0..column_count {
                    let name = cursor.read_str()?;
                    let value = cursor.read_value()?;
                    columns.push((name, value));
                }
                Mutation::Write {
                    kind,
                    table,
                    columns,
                }
            }
            OP_DELETE => {
                let key_count = cursor.read_u32()? as usize;
                let mut keys = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    keys.push(cursor.read_key_values()?);
                }
                let range_count = cursor.read_u32()? as usize;
                let mut ranges = Vec::with_capacity(range_count);
                for _ in 0..range_count {
                    let flags = cursor.read_u8()?;
                    let start = cursor.read_key_values()?;
                    let end = cursor.read_key_values()?;
                    ranges.push(KeyRange {
                        start,
                        end,
                        start_closed: flags & RANGE_FLAG_START_CLOSED != 0,
                        end_closed: flags & RANGE_FLAG_END_CLOSED != 0,
                    });
                }
                Mutation::Delete {
                    table,
                    key_set: KeySet { keys, ranges },
                }
            }
            other => {
                return Err(SinkError::Encoding(format!(
                    "unknown mutation op tag 0x{other:02x}"
                )))
            }
        };
        validate_mutation(schema, &mutation)?;
        mutations.push(mutation);
    }
    if !cursor.is_exhausted() {
        return Err(SinkError::Encoding(
            "trailing bytes after mutation group payload".to_string(),
        ));
    }
    MutationGroup::from_mutations(mutations)
}

fn write_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(SinkError::Encoding(format!(
            "identifier longer than {} bytes",
            u16::MAX
        )));
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(VALUE_NULL),
        Value::Bool(v) => {
            out.push(VALUE_BOOL);
            out.push(u8::from(*v));
        }
        Value::Int64(v) => {
            out.push(VALUE_INT64);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Float64(v) => {
            out.push(VALUE_FLOAT64);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Utf8(v) => {
            out.push(VALUE_UTF8);
            out.extend_from_slice(&(v.len() as u32).to_be_bytes());
            out.extend_from_slice(v.as_bytes());
        }
        Value::Bytes(v) => {
            out.push(VALUE_BYTES);
            out.extend_from_slice(&(v.len() as u32).to_be_bytes());
            out.extend_from_slice(v);
        }
        Value::TimestampNanos(v) => {
            out.push(VALUE_TIMESTAMP);
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
}

fn write_key_values(out: &mut Vec<u8>, values: &[Value]) {
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for value in values {
        write_value(out, value);
    }
}

/// Bounds-checked reader over a serialized payload.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(SinkError::Encoding(
                "unexpected end of mutation group payload".to_string(),
            )),
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(i64::from_be_bytes(buf))
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| SinkError::Encoding("identifier is not valid UTF-8".to_string()))
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        match tag {
            VALUE_NULL => Ok(Value::Null),
            VALUE_BOOL => Ok(Value::Bool(self.read_u8()? != 0)),
            VALUE_INT64 => Ok(Value::Int64(self.read_i64()?)),
            VALUE_FLOAT64 => {
                let raw = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok(Value::Float64(f64::from_bits(u64::from_be_bytes(buf))))
            }
            VALUE_UTF8 => {
                let len = self.read_u32()? as usize;
                let raw = self.take(len)?;
                let text = String::from_utf8(raw.to_vec()).map_err(|_| {
                    SinkError::Encoding("string value is not valid UTF-8".to_string())
                })?;
                Ok(Value::Utf8(text))
            }
            VALUE_BYTES => {
                let len = self.read_u32()? as usize;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            VALUE_TIMESTAMP => Ok(Value::TimestampNanos(self.read_i64()?)),
            other => Err(SinkError::Encoding(format!(
                "unknown value tag 0x{other:02x}"
            ))),
        }
    }

    fn read_key_values(&mut self) -> Result<Vec<Value>> {
        let count = self.read_u16()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_value()?);
        }
        Ok(values)
    }
}
