/*
    navcard
    https://github.com/navcard/navcard

    Copyright 2025 navcard contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/dbf.rs

    A minimal dBase III codec for the DBF tables and DBT memo files shipped
    with electronic chart subscriptions. Only the field types those tables
    use are supported.
*/

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use binrw::{binrw, BinRead, BinWrite};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbfError {
    #[error("unsupported DBF version: {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported field type: {0:?}")]
    UnsupportedFieldType(char),
    #[error("deleted record")]
    DeletedRecord,
    #[error("malformed DBF data: {0}")]
    MalformedDbf(String),
    #[error("malformed DBT data: {0}")]
    MalformedDbt(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<binrw::Error> for DbfError {
    fn from(err: binrw::Error) -> Self {
        DbfError::MalformedDbf(err.to_string())
    }
}

/// Marker terminating the field descriptor array.
const FIELD_TERMINATOR: u8 = 0x0D;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbfHeader {
    /// Version in the low bits; only dBase III (3) is accepted.
    pub info: u8,
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub num_records: u32,
    pub header_bytes: u16,
    #[brw(pad_after = 20)]
    pub record_bytes: u16,
}

pub const DBF_HEADER_SIZE: usize = 32;
pub const DBF_VERSION: u8 = 3;

impl DbfHeader {
    /// A fresh header stamped with the given date (`year` is the full year).
    pub fn new(year: u16, month: u8, day: u8) -> Self {
        DbfHeader {
            info: DBF_VERSION,
            year: (year - 1900) as u8,
            month,
            day,
            num_records: 0,
            header_bytes: 0,
            record_bytes: 0,
        }
    }

    pub fn version(&self) -> u8 {
        self.info & 0x03
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbfField {
    name: [u8; 11],
    field_type: u8,
    #[brw(pad_before = 4, pad_after = 15)]
    pub length: u8,
}

pub const DBF_FIELD_SIZE: usize = 32;

impl DbfField {
    pub fn new(name: &str, field_type: char, length: u8) -> Self {
        let mut name_buf = [0u8; 11];
        let bytes = name.as_bytes();
        name_buf[..bytes.len().min(11)].copy_from_slice(&bytes[..bytes.len().min(11)]);
        DbfField {
            name: name_buf,
            field_type: field_type as u8,
            length,
        }
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(11);
        self.name[..end].iter().map(|&b| b as char).collect()
    }

    pub fn field_type(&self) -> char {
        self.field_type as char
    }
}

/// A single field value. Numeric covers both `N` and `M` fields, since memo
/// references are stored as decimal block indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Date(Option<String>),
    Logical(Option<bool>),
    Number(Option<i64>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Value::Number(n) => *n,
            _ => None,
        }
    }
}

fn latin1_decode(data: &[u8]) -> String {
    data.iter().map(|&b| b as char).collect()
}

fn latin1_encode(s: &str) -> Vec<u8> {
    s.chars().map(|c| c as u8).collect()
}

pub struct DbfFile;

impl DbfFile {
    pub fn read_header<R: Read>(r: &mut R) -> Result<(DbfHeader, Vec<DbfField>), DbfError> {
        let mut buf = [0u8; DBF_HEADER_SIZE];
        r.read_exact(&mut buf)?;
        let header = DbfHeader::read(&mut Cursor::new(&buf))?;
        if header.version() != DBF_VERSION {
            return Err(DbfError::UnsupportedVersion(header.version()));
        }

        let num_fields = (header.header_bytes as usize).saturating_sub(33) / DBF_FIELD_SIZE;
        let mut fields = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let mut buf = [0u8; DBF_FIELD_SIZE];
            r.read_exact(&mut buf)?;
            fields.push(DbfField::read(&mut Cursor::new(&buf))?);
        }

        let mut term = [0u8; 1];
        r.read_exact(&mut term)?;
        if term[0] != FIELD_TERMINATOR {
            return Err(DbfError::MalformedDbf("missing field array terminator".into()));
        }
        Ok((header, fields))
    }

    pub fn write_header<W: Write>(
        w: &mut W,
        header: &DbfHeader,
        fields: &[DbfField],
    ) -> Result<(), DbfError> {
        let mut header = header.clone();
        header.header_bytes = (fields.len() * DBF_FIELD_SIZE + 33) as u16;

        let mut buf = Cursor::new(Vec::with_capacity(header.header_bytes as usize));
        header.write(&mut buf)?;
        for field in fields {
            field.write(&mut buf)?;
        }
        buf.get_mut().push(FIELD_TERMINATOR);
        w.write_all(buf.get_ref())?;
        Ok(())
    }

    pub fn read_record<R: Read>(r: &mut R, fields: &[DbfField]) -> Result<Vec<Value>, DbfError> {
        let mut marker = [0u8; 1];
        r.read_exact(&mut marker)?;
        match marker[0] {
            b' ' => {}
            b'*' => return Err(DbfError::DeletedRecord),
            other => {
                return Err(DbfError::MalformedDbf(format!(
                    "bad deletion marker: {:02x}",
                    other
                )))
            }
        }

        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let mut buf = vec![0u8; field.length as usize];
            r.read_exact(&mut buf)?;
            let data = latin1_decode(&buf);
            let value = match field.field_type() {
                'C' => Value::Text(data.trim_end_matches(' ').to_string()),
                'D' => {
                    let trimmed = data.trim();
                    if trimmed.is_empty() {
                        Value::Date(None)
                    } else {
                        Value::Date(Some(data))
                    }
                }
                'L' => match data.chars().next() {
                    Some('Y') | Some('y') | Some('T') | Some('t') => Value::Logical(Some(true)),
                    Some('N') | Some('n') | Some('F') | Some('f') => Value::Logical(Some(false)),
                    Some('?') | Some(' ') | None => Value::Logical(None),
                    Some(other) => {
                        return Err(DbfError::MalformedDbf(format!(
                            "bad logical value: {:?}",
                            other
                        )))
                    }
                },
                'M' | 'N' => {
                    let trimmed = data.trim_matches(' ');
                    if trimmed.is_empty() {
                        Value::Number(None)
                    } else {
                        let n = trimmed.parse::<i64>().map_err(|_| {
                            DbfError::MalformedDbf(format!("bad number: {:?}", trimmed))
                        })?;
                        Value::Number(Some(n))
                    }
                }
                other => return Err(DbfError::UnsupportedFieldType(other)),
            };
            values.push(value);
        }
        Ok(values)
    }

    pub fn write_record<W: Write>(
        w: &mut W,
        fields: &[DbfField],
        values: &[Value],
    ) -> Result<(), DbfError> {
        w.write_all(b" ")?;
        for (field, value) in fields.iter().zip(values) {
            let len = field.length as usize;
            let data: String = match (field.field_type(), value) {
                ('C', Value::Text(s)) => format!("{:<len$}", s, len = len),
                ('D', Value::Date(Some(s))) => format!("{:<len$}", s, len = len),
                ('D', Value::Date(None)) => " ".repeat(len),
                ('L', Value::Logical(v)) => {
                    let c = match v {
                        Some(true) => 'T',
                        Some(false) => 'F',
                        None => '?',
                    };
                    format!("{:<len$}", c, len = len)
                }
                // Numbers are left-justified here, matching the distribution
                // tool byte-for-byte even though xBase says right-justified.
                ('M', Value::Number(v)) | ('N', Value::Number(v)) => {
                    let s = v.map(|n| n.to_string()).unwrap_or_default();
                    format!("{:<len$}", s, len = len)
                }
                (t @ ('C' | 'D' | 'L' | 'M' | 'N'), _) => {
                    return Err(DbfError::MalformedDbf(format!(
                        "value does not match field type {:?}",
                        t
                    )))
                }
                (other, _) => return Err(DbfError::UnsupportedFieldType(other)),
            };
            let encoded = latin1_encode(&data);
            if encoded.len() != len {
                return Err(DbfError::MalformedDbf(format!(
                    "field {:?} value does not fit in {} bytes",
                    field.name(),
                    len
                )));
            }
            w.write_all(&encoded)?;
        }
        Ok(())
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbtHeader {
    pub next_free: u32,
    pub dbf_name: [u8; 8],
    reserved: u32,
    /// 0 means dBase III 512-byte blocks with a double-0x1A terminator;
    /// non-zero means dBase IV records with an 8-byte prefix.
    #[brw(pad_after = 494)]
    pub block_length: u16,
}

pub const DBT_HEADER_SIZE: usize = 512;
const DBT_BLOCK_III: usize = 512;
const DBASE4_PREFIX: [u8; 4] = [0xFF, 0xFF, 0x08, 0x00];

impl DbtHeader {
    pub fn new(dbf_name: &str, block_length: u16) -> Self {
        let mut name = [0u8; 8];
        let bytes = latin1_encode(dbf_name);
        name[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        DbtHeader {
            next_free: 1,
            dbf_name: name,
            reserved: 0,
            block_length,
        }
    }

    fn block_size(&self) -> usize {
        if self.block_length == 0 {
            DBT_BLOCK_III
        } else {
            self.block_length as usize
        }
    }
}

/// Reader over a DBT memo file.
pub struct DbtReader<R> {
    pub header: DbtHeader,
    inner: R,
}

impl<R: Read + Seek> DbtReader<R> {
    pub fn new(mut inner: R) -> Result<Self, DbfError> {
        let mut buf = [0u8; DBT_HEADER_SIZE];
        inner.read_exact(&mut buf)?;
        let header = DbtHeader::read(&mut Cursor::new(&buf))
            .map_err(|e| DbfError::MalformedDbt(e.to_string()))?;
        Ok(DbtReader { header, inner })
    }

    pub fn read_record(&mut self, index: u32) -> Result<Vec<u8>, DbfError> {
        let block_size = self.header.block_size();
        self.inner.seek(SeekFrom::Start(index as u64 * block_size as u64))?;

        if self.header.block_length == 0 {
            // dBase III: scan for the double-0x1A terminator.
            let mut out = Vec::new();
            let mut byte = [0u8; 1];
            let mut last = 0u8;
            loop {
                self.inner.read_exact(&mut byte).map_err(|_| {
                    DbfError::MalformedDbt("memo record is missing its terminator".into())
                })?;
                if last == 0x1A && byte[0] == 0x1A {
                    out.pop();
                    return Ok(out);
                }
                out.push(byte[0]);
                last = byte[0];
            }
        } else {
            let mut prefix = [0u8; 8];
            self.inner.read_exact(&mut prefix)?;
            if prefix[0..4] != DBASE4_PREFIX {
                return Err(DbfError::MalformedDbt(format!(
                    "bad memo record prefix: {:02x?}",
                    &prefix[0..4]
                )));
            }
            let total = u32::from_le_bytes(prefix[4..8].try_into().unwrap()) as usize;
            if total < 8 {
                return Err(DbfError::MalformedDbt("memo record is too short".into()));
            }
            let mut out = vec![0u8; total - 8];
            self.inner.read_exact(&mut out)?;
            Ok(out)
        }
    }
}

/// Writer producing a fresh DBT memo file, appending records sequentially and
/// renumbering them from block 1.
pub struct DbtWriter<W> {
    header: DbtHeader,
    inner: W,
}

impl<W: Write + Seek> DbtWriter<W> {
    pub fn new(mut inner: W, dbf_name: &str, block_length: u16) -> Result<Self, DbfError> {
        let header = DbtHeader::new(dbf_name, block_length);
        let mut buf = Cursor::new(Vec::with_capacity(DBT_HEADER_SIZE));
        header
            .write(&mut buf)
            .map_err(|e| DbfError::MalformedDbt(e.to_string()))?;
        inner.write_all(buf.get_ref())?;
        Ok(DbtWriter { header, inner })
    }

    /// Append one memo record and return its block index.
    pub fn append(&mut self, data: &[u8]) -> Result<u32, DbfError> {
        let index = self.header.next_free;
        let block_size = self.header.block_size();

        if self.header.block_length == 0 {
            let total = data.len() + 2;
            let blocks = total.div_ceil(block_size);
            let mut buf = Vec::with_capacity(blocks * block_size);
            buf.extend_from_slice(data);
            buf.extend_from_slice(&[0x1A, 0x1A]);
            buf.resize(blocks * block_size, 0);
            self.inner.write_all(&buf)?;
            self.header.next_free += blocks as u32;
        } else {
            let total = data.len() + 8;
            let blocks = total.div_ceil(block_size);
            let mut buf = Vec::with_capacity(blocks * block_size);
            buf.extend_from_slice(&DBASE4_PREFIX);
            buf.extend_from_slice(&(total as u32).to_le_bytes());
            buf.extend_from_slice(data);
            buf.resize(blocks * block_size, 0);
            self.inner.write_all(&buf)?;
            self.header.next_free += blocks as u32;
        }
        Ok(index)
    }

    /// Patch the next-free block count into the header and return the inner
    /// writer positioned at the end of the memo data.
    pub fn finish(mut self) -> Result<W, DbfError> {
        let end = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(0))?;
        let mut buf = Cursor::new(Vec::with_capacity(DBT_HEADER_SIZE));
        self.header
            .write(&mut buf)
            .map_err(|e| DbfError::MalformedDbt(e.to_string()))?;
        self.inner.write_all(buf.get_ref())?;
        self.inner.seek(SeekFrom::Start(end))?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> Vec<DbfField> {
        vec![
            DbfField::new("ICAO_ID", 'C', 4),
            DbfField::new("EFF_DATE", 'D', 8),
            DbfField::new("ACTIVE", 'L', 1),
            DbfField::new("CHT_NO", 'N', 6),
        ]
    }

    #[test]
    fn test_header_round_trip() {
        let fields = sample_fields();
        let mut header = DbfHeader::new(2025, 3, 14);
        header.num_records = 2;
        header.record_bytes = 1 + 4 + 8 + 1 + 6;

        let mut buf = Vec::new();
        DbfFile::write_header(&mut buf, &header, &fields).unwrap();
        assert_eq!(buf.len(), 32 + 4 * 32 + 1);

        let (header2, fields2) = DbfFile::read_header(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(header2.num_records, 2);
        assert_eq!(header2.year, 125);
        assert_eq!(fields2, fields);
        assert_eq!(fields2[0].name(), "ICAO_ID");
    }

    #[test]
    fn test_record_round_trip() {
        let fields = sample_fields();
        let values = vec![
            Value::Text("KJFK".into()),
            Value::Date(Some("20250314".into())),
            Value::Logical(Some(true)),
            Value::Number(Some(42)),
        ];
        let mut buf = Vec::new();
        DbfFile::write_record(&mut buf, &fields, &values).unwrap();
        assert_eq!(buf.len(), 1 + 4 + 8 + 1 + 6);

        let values2 = DbfFile::read_record(&mut Cursor::new(&buf), &fields).unwrap();
        assert_eq!(values, values2);
    }

    #[test]
    fn test_numeric_left_justified() {
        let fields = vec![DbfField::new("CHT_NO", 'N', 6)];
        let mut buf = Vec::new();
        DbfFile::write_record(&mut buf, &fields, &[Value::Number(Some(7))]).unwrap();
        assert_eq!(&buf, b" 7     ");
    }

    #[test]
    fn test_deleted_record() {
        let fields = vec![DbfField::new("ICAO_ID", 'C', 4)];
        let buf = b"*KJFK".to_vec();
        assert!(matches!(
            DbfFile::read_record(&mut Cursor::new(&buf), &fields),
            Err(DbfError::DeletedRecord)
        ));
    }

    #[test]
    fn test_unsupported_field_type() {
        let fields = vec![DbfField::new("WEIRD", 'F', 4)];
        let buf = b" 1.25".to_vec();
        assert!(matches!(
            DbfFile::read_record(&mut Cursor::new(&buf), &fields),
            Err(DbfError::UnsupportedFieldType('F'))
        ));
    }

    #[test]
    fn test_dbt_dbase3_round_trip() {
        let mut buf = Cursor::new(Vec::new());
        let mut writer = DbtWriter::new(&mut buf, "notams", 0).unwrap();
        let first = writer.append(b"FIRST NOTAM TEXT").unwrap();
        let second = writer.append(&vec![b'x'; 600]).unwrap();
        writer.finish().unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);

        buf.set_position(0);
        let mut reader = DbtReader::new(&mut buf).unwrap();
        assert_eq!(reader.header.next_free, 4);
        assert_eq!(reader.read_record(first).unwrap(), b"FIRST NOTAM TEXT");
        assert_eq!(reader.read_record(second).unwrap(), vec![b'x'; 600]);
    }

    #[test]
    fn test_dbt_dbase4_round_trip() {
        let mut buf = Cursor::new(Vec::new());
        let mut writer = DbtWriter::new(&mut buf, "notams", 512).unwrap();
        let first = writer.append(b"payload one").unwrap();
        let second = writer.append(&vec![b'y'; 1000]).unwrap();
        writer.finish().unwrap();

        buf.set_position(0);
        let mut reader = DbtReader::new(&mut buf).unwrap();
        assert_eq!(reader.read_record(first).unwrap(), b"payload one");
        assert_eq!(reader.read_record(second).unwrap(), vec![b'y'; 1000]);
    }
}
