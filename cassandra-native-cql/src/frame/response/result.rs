//! CQL protocol-level representation of a `RESULT` response.

use crate::deserialize::{DeserializationError, DeserializeValue};
use crate::frame::frame_errors::{
    CqlResultParseError, LowLevelDeserializationError, PreparedParseError,
    ResultMetadataParseError, RowsParseError, SchemaChangeEventParseError,
};
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use bytes::{BufMut, Bytes};
use std::result::Result as StdResult;
use std::sync::Arc;

const RESULT_KIND_VOID: i32 = 0x0001;
const RESULT_KIND_ROWS: i32 = 0x0002;
const RESULT_KIND_SET_KEYSPACE: i32 = 0x0003;
const RESULT_KIND_PREPARED: i32 = 0x0004;
const RESULT_KIND_SCHEMA_CHANGE: i32 = 0x0005;

// Result metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

/// Keyspace and table a column belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    ks_name: String,
    table_name: String,
}

impl TableSpec {
    pub fn new(ks_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            ks_name: ks_name.into(),
            table_name: table_name.into(),
        }
    }

    pub fn ks_name(&self) -> &str {
        &self.ks_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

/// Type of a column, as described by the `[option]` of the metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

impl ColumnType {
    /// Writes the `[option]` describing this type.
    pub fn serialize(&self, buf: &mut impl BufMut) -> StdResult<(), std::num::TryFromIntError> {
        use ColumnType::*;

        let id: u16 = match self {
            Custom(_) => 0x0000,
            Ascii => 0x0001,
            BigInt => 0x0002,
            Blob => 0x0003,
            Boolean => 0x0004,
            Counter => 0x0005,
            Decimal => 0x0006,
            Double => 0x0007,
            Float => 0x0008,
            Int => 0x0009,
            Timestamp => 0x000B,
            Uuid => 0x000C,
            Text => 0x000D,
            Varint => 0x000E,
            Timeuuid => 0x000F,
            Inet => 0x0010,
            Date => 0x0011,
            Time => 0x0012,
            SmallInt => 0x0013,
            TinyInt => 0x0014,
            Duration => 0x0015,
            List(_) => 0x0020,
            Map(_, _) => 0x0021,
            Set(_) => 0x0022,
            UserDefinedType { .. } => 0x0030,
            Tuple(_) => 0x0031,
        };
        types::write_short(id, buf);

        match self {
            Custom(class_name) => types::write_string(class_name, buf)?,
            List(elem) | Set(elem) => elem.serialize(buf)?,
            Map(key, value) => {
                key.serialize(buf)?;
                value.serialize(buf)?;
            }
            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            } => {
                types::write_string(keyspace, buf)?;
                types::write_string(type_name, buf)?;
                types::write_short_length(field_types.len(), buf)?;
                for (name, typ) in field_types {
                    types::write_string(name, buf)?;
                    typ.serialize(buf)?;
                }
            }
            Tuple(elems) => {
                types::write_short_length(elems.len(), buf)?;
                for elem in elems {
                    elem.serialize(buf)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Describes a single column of a result set or a single bind marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub(crate) table_spec: TableSpec,
    pub(crate) name: String,
    pub(crate) typ: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, typ: ColumnType, table_spec: TableSpec) -> Self {
        Self {
            table_spec,
            name: name.into(),
            typ,
        }
    }

    #[inline]
    pub fn table_spec(&self) -> &TableSpec {
        &self.table_spec
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn typ(&self) -> &ColumnType {
        &self.typ
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultMetadata {
    col_count: usize,
    paging_state: Option<Bytes>,
    col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn new(col_specs: Vec<ColumnSpec>) -> Self {
        Self {
            col_count: col_specs.len(),
            paging_state: None,
            col_specs,
        }
    }

    #[inline]
    pub fn col_count(&self) -> usize {
        self.col_count
    }

    #[inline]
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    /// Opaque state to resume paging from, present when more pages exist.
    #[inline]
    pub fn paging_state(&self) -> Option<&Bytes> {
        self.paging_state.as_ref()
    }

    fn serialize(&self, buf: &mut impl BufMut) -> StdResult<(), std::num::TryFromIntError> {
        let mut flags = 0;
        if self.paging_state.is_some() {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        types::write_int(flags, buf);
        types::write_int_length(self.col_count, buf)?;
        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }
        serialize_col_specs(&self.col_specs, buf)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PartitionKeyIndex {
    /// index in the serialized values
    pub index: u16,
    /// sequence number in partition key
    pub sequence: u16,
}

#[derive(Debug, Clone, Default)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// pk_indexes are sorted by `index` and can be reordered in partition key order
    /// using `sequence` field
    pub pk_indexes: Vec<PartitionKeyIndex>,
    pub col_specs: Vec<ColumnSpec>,
}

/// A single row of a result set. Cells are kept in their serialized form
/// and deserialized on access.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

impl Row {
    /// Deserializes the cell at `index` into `T`.
    pub fn get<T: DeserializeValue>(&self, index: usize) -> StdResult<T, DeserializationError> {
        let cell = self
            .columns
            .get(index)
            .ok_or(DeserializationError::ColumnIndexOutOfRange {
                index,
                column_count: self.columns.len(),
            })?;
        T::deserialize(cell.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct Rows {
    pub metadata: Arc<ResultMetadata>,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

impl Rows {
    /// Builds a result set with the given columns and rows.
    pub fn new(col_specs: Vec<ColumnSpec>, rows: Vec<Row>) -> Self {
        Self {
            metadata: Arc::new(ResultMetadata::new(col_specs)),
            rows_count: rows.len(),
            rows,
        }
    }

    pub fn col_specs(&self) -> &[ColumnSpec] {
        self.metadata.col_specs()
    }
}

#[derive(Debug, Clone)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

impl Result {
    /// Serializes the RESULT body the way a server would send it.
    pub fn serialize(&self, buf: &mut impl BufMut) -> StdResult<(), std::num::TryFromIntError> {
        match self {
            Result::Void => types::write_int(RESULT_KIND_VOID, buf),
            Result::Rows(rows) => {
                types::write_int(RESULT_KIND_ROWS, buf);
                rows.metadata.serialize(buf)?;
                types::write_int_length(rows.rows.len(), buf)?;
                for row in &rows.rows {
                    for cell in &row.columns {
                        types::write_bytes_opt(cell.as_ref(), buf)?;
                    }
                }
            }
            Result::SetKeyspace(set_keyspace) => {
                types::write_int(RESULT_KIND_SET_KEYSPACE, buf);
                types::write_string(&set_keyspace.keyspace_name, buf)?;
            }
            Result::Prepared(prepared) => {
                types::write_int(RESULT_KIND_PREPARED, buf);
                types::write_short_bytes(&prepared.id, buf)?;

                let bind = &prepared.prepared_metadata;
                types::write_int(bind.flags & !FLAG_GLOBAL_TABLES_SPEC, buf);
                types::write_int_length(bind.col_count, buf)?;
                types::write_int_length(bind.pk_indexes.len(), buf)?;
                let mut pk_in_sequence = bind.pk_indexes.clone();
                pk_in_sequence.sort_unstable_by_key(|pki| pki.sequence);
                for pki in pk_in_sequence {
                    types::write_short(pki.index, buf);
                }
                serialize_col_specs(&bind.col_specs, buf)?;

                prepared.result_metadata.serialize(buf)?;
            }
            Result::SchemaChange(schema_change) => {
                types::write_int(RESULT_KIND_SCHEMA_CHANGE, buf);
                schema_change.event.serialize(buf)?;
            }
        }
        Ok(())
    }
}

fn serialize_col_specs(
    col_specs: &[ColumnSpec],
    buf: &mut impl BufMut,
) -> StdResult<(), std::num::TryFromIntError> {
    for spec in col_specs {
        types::write_string(spec.table_spec.ks_name(), buf)?;
        types::write_string(spec.table_spec.table_name(), buf)?;
        types::write_string(&spec.name, buf)?;
        spec.typ.serialize(buf)?;
    }
    Ok(())
}

fn deser_type(
    buf: &mut &[u8],
    column_index: usize,
) -> StdResult<ColumnType, ResultMetadataParseError> {
    use ColumnType::*;

    let spec_err = |err: LowLevelDeserializationError| ResultMetadataParseError::ColumnSpecParseError {
        column_index,
        err,
    };

    let id = types::read_short(buf).map_err(spec_err)?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf).map_err(spec_err)?.to_owned()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf, column_index)?)),
        0x0021 => Map(
            Box::new(deser_type(buf, column_index)?),
            Box::new(deser_type(buf, column_index)?),
        ),
        0x0022 => Set(Box::new(deser_type(buf, column_index)?)),
        0x0030 => {
            let keyspace = types::read_string(buf).map_err(spec_err)?.to_owned();
            let type_name = types::read_string(buf).map_err(spec_err)?.to_owned();
            let fields_size = types::read_short_length(buf).map_err(spec_err)?;

            let mut field_types = Vec::with_capacity(fields_size);
            for _ in 0..fields_size {
                let field_name = types::read_string(buf).map_err(spec_err)?.to_owned();
                let field_type = deser_type(buf, column_index)?;
                field_types.push((field_name, field_type));
            }

            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            }
        }
        0x0031 => {
            let len = types::read_short_length(buf).map_err(spec_err)?;
            let mut elems = Vec::with_capacity(len);
            for _ in 0..len {
                elems.push(deser_type(buf, column_index)?);
            }
            Tuple(elems)
        }
        type_id => {
            return Err(ResultMetadataParseError::UnsupportedColumnType {
                column_index,
                type_id,
            })
        }
    })
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ResultMetadataParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for column_index in 0..col_count {
        let spec_err = |err| ResultMetadataParseError::ColumnSpecParseError { column_index, err };

        let table_spec = match &global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf).map_err(spec_err)?,
        };
        let name = types::read_string(buf).map_err(spec_err)?.to_owned();
        let typ = deser_type(buf, column_index)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(buf: &mut &[u8]) -> StdResult<ResultMetadata, ResultMetadataParseError> {
    let flags = types::read_int(buf).map_err(ResultMetadataParseError::FlagsParseError)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count =
        types::read_int_length(buf).map_err(ResultMetadataParseError::ColumnCountParseError)?;

    let paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map_err(ResultMetadataParseError::PagingStateParseError))
        .transpose()?
        .map(Bytes::copy_from_slice);

    let col_specs = if no_metadata {
        vec![]
    } else {
        let global_table_spec = global_tables_spec
            .then(|| {
                deser_table_spec(buf).map_err(ResultMetadataParseError::GlobalTableSpecParseError)
            })
            .transpose()?;

        deser_col_specs(buf, global_table_spec, col_count)?
    };

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_prepared_metadata(
    buf: &mut &[u8],
) -> StdResult<PreparedMetadata, ResultMetadataParseError> {
    let flags = types::read_int(buf).map_err(ResultMetadataParseError::FlagsParseError)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count =
        types::read_int_length(buf).map_err(ResultMetadataParseError::ColumnCountParseError)?;

    let pk_count: usize =
        types::read_int_length(buf).map_err(ResultMetadataParseError::PkCountParseError)?;

    let mut pk_indexes = Vec::with_capacity(pk_count);
    for i in 0..pk_count {
        pk_indexes.push(PartitionKeyIndex {
            index: types::read_short(buf).map_err(ResultMetadataParseError::PkIndexParseError)?,
            sequence: i as u16,
        });
    }
    pk_indexes.sort_unstable_by_key(|pki| pki.index);

    let global_table_spec = global_tables_spec
        .then(|| deser_table_spec(buf).map_err(ResultMetadataParseError::GlobalTableSpecParseError))
        .transpose()?;

    let col_specs = deser_col_specs(buf, global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_rows(buf_bytes: &Bytes, buf: &mut &[u8]) -> StdResult<Rows, RowsParseError> {
    let metadata = deser_result_metadata(buf)?;

    let rows_count: usize =
        types::read_int_length(buf).map_err(RowsParseError::RowsCountParseError)?;

    let col_count = metadata.col_count;
    let mut rows = Vec::with_capacity(rows_count);
    for row_index in 0..rows_count {
        let mut columns = Vec::with_capacity(col_count);
        for column_index in 0..col_count {
            let cell = types::read_bytes_opt(buf).map_err(|err| RowsParseError::CellParseError {
                row_index,
                column_index,
                err,
            })?;
            columns.push(cell.map(|cell| buf_bytes.slice_ref(cell)));
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata: Arc::new(metadata),
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, CqlResultParseError> {
    let keyspace_name = types::read_string(buf)
        .map_err(CqlResultParseError::SetKeyspaceParseError)?
        .to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(buf: &mut &[u8]) -> StdResult<Prepared, PreparedParseError> {
    let id = Bytes::copy_from_slice(
        types::read_short_bytes(buf).map_err(PreparedParseError::IdParseError)?,
    );
    let prepared_metadata =
        deser_prepared_metadata(buf).map_err(PreparedParseError::BindMetadataParseError)?;
    let result_metadata =
        deser_result_metadata(buf).map_err(PreparedParseError::ResultMetadataParseError)?;

    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, SchemaChangeEventParseError> {
    Ok(SchemaChange {
        event: SchemaChangeEvent::deserialize(buf)?,
    })
}

/// Deserializes a RESULT body. Cells of a Rows result share `buf_bytes`.
pub fn deserialize(buf_bytes: &Bytes) -> StdResult<Result, CqlResultParseError> {
    let buf = &mut &buf_bytes[..];
    use self::Result::*;
    Ok(
        match types::read_int(buf).map_err(CqlResultParseError::ResultIdParseError)? {
            RESULT_KIND_VOID => Void,
            RESULT_KIND_ROWS => Rows(deser_rows(buf_bytes, buf)?),
            RESULT_KIND_SET_KEYSPACE => SetKeyspace(deser_set_keyspace(buf)?),
            RESULT_KIND_PREPARED => Prepared(deser_prepared(buf)?),
            RESULT_KIND_SCHEMA_CHANGE => SchemaChange(deser_schema_change(buf)?),
            id => return Err(CqlResultParseError::UnknownResultId(id)),
        },
    )
}
