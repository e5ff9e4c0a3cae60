use crate::model::error::{Error, KmsError, KmsErrorKind, KmsResult};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};

/// All messages allow to be visited
/// to retrieve the inner value without
/// knowing the concrete type
pub enum DataType<'a> {
    Component(&'a Component),
    Trame(&'a Trame),
    U64(u64),
    U32(u32),
    U16(u16),
    U8(u8),
    Slice(&'a [u8]),
    None,
}

/// Options computed during read or write
/// to drive dynamically sized or skipped fields
pub enum MessageOption {
    /// Skip a field identified by its name
    SkipField(String),
    /// Limit the number of bytes read by the named field
    Size(String, usize),
    None,
}

/// A message is anything that knows how to
/// read and write itself on a binary stream
pub trait Message {
    /// Write node to the Writer
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()>;
    /// Read node from the Reader
    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()>;
    /// Length in bytes of the node
    fn length(&self) -> u64;
    /// Retrieve the inner value
    fn visit(&self) -> DataType;
    /// Dynamic behavior of the message
    fn options(&self) -> MessageOption;
}

/// u8 is a message
impl Message for u8 {
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        writer.write_u8(*self)?;
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        *self = reader.read_u8()?;
        Ok(())
    }

    fn length(&self) -> u64 {
        1
    }

    fn visit(&self) -> DataType {
        DataType::U8(*self)
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// Value with an explicit endianness on the wire
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Value<T> {
    /// Big endian
    BE(T),
    /// Little endian
    LE(T),
}

impl<T: Copy> Value<T> {
    /// Return the inner value whatever the endianness
    pub fn inner(&self) -> T {
        match self {
            Value::BE(e) | Value::LE(e) => *e,
        }
    }
}

pub type U16 = Value<u16>;

impl Message for U16 {
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        match self {
            U16::BE(value) => writer.write_u16::<BigEndian>(*value)?,
            U16::LE(value) => writer.write_u16::<LittleEndian>(*value)?,
        };
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        match self {
            U16::BE(value) => *value = reader.read_u16::<BigEndian>()?,
            U16::LE(value) => *value = reader.read_u16::<LittleEndian>()?,
        };
        Ok(())
    }

    fn length(&self) -> u64 {
        2
    }

    fn visit(&self) -> DataType {
        DataType::U16(self.inner())
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

pub type U32 = Value<u32>;

impl Message for U32 {
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        match self {
            U32::BE(value) => writer.write_u32::<BigEndian>(*value)?,
            U32::LE(value) => writer.write_u32::<LittleEndian>(*value)?,
        };
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        match self {
            U32::BE(value) => *value = reader.read_u32::<BigEndian>()?,
            U32::LE(value) => *value = reader.read_u32::<LittleEndian>()?,
        };
        Ok(())
    }

    fn length(&self) -> u64 {
        4
    }

    fn visit(&self) -> DataType {
        DataType::U32(self.inner())
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// 64 bit fields appear in filetime slots
pub type U64 = Value<u64>;

impl Message for U64 {
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        match self {
            U64::BE(value) => writer.write_u64::<BigEndian>(*value)?,
            U64::LE(value) => writer.write_u64::<LittleEndian>(*value)?,
        };
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        match self {
            U64::BE(value) => *value = reader.read_u64::<BigEndian>()?,
            U64::LE(value) => *value = reader.read_u64::<LittleEndian>()?,
        };
        Ok(())
    }

    fn length(&self) -> u64 {
        8
    }

    fn visit(&self) -> DataType {
        DataType::U64(self.inner())
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// A raw byte buffer
///
/// An empty vector reads until the end of the stream,
/// a non empty one reads exactly its current length.
impl Message for Vec<u8> {
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        writer.write_all(self)?;
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        if self.is_empty() {
            reader.read_to_end(self)?;
        } else {
            reader.read_exact(self)?;
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.len() as u64
    }

    fn visit(&self) -> DataType {
        DataType::Slice(self.as_slice())
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// An ordered set of named messages
///
/// # Example
/// ```
/// #[macro_use]
/// # extern crate kms;
/// use kms::model::data::{Component, DataType, Message, U16, U32};
/// use std::io::Cursor;
/// # fn main() {
/// let mut header = component![
///     "fragLength" => U16::LE(0),
///     "callId" => U32::LE(0)
/// ];
/// header.read(&mut Cursor::new(vec![0x10, 0x00, 0x02, 0x00, 0x00, 0x00])).unwrap();
/// assert_eq!(cast!(DataType::U16, header["fragLength"]).unwrap(), 0x10);
/// # }
/// ```
pub type Component = IndexMap<String, Box<dyn Message>>;

impl Message for Component {
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        let mut filtering_key = HashSet::new();
        for (name, value) in self.iter() {
            if filtering_key.contains(name.as_str()) {
                continue;
            }
            value.write(writer)?;
            if let MessageOption::SkipField(field) = value.options() {
                filtering_key.insert(field);
            }
        }
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        let mut filtering_key: HashSet<String> = HashSet::new();
        let mut dynamic_size: HashMap<String, usize> = HashMap::new();
        for (name, value) in self.iter_mut() {
            if filtering_key.contains(name.as_str()) {
                continue;
            }
            if let Some(size) = dynamic_size.get(name.as_str()) {
                let mut local = vec![0; *size];
                reader.read_exact(&mut local)?;
                value.read(&mut Cursor::new(local))?;
            } else {
                value.read(reader)?;
            }
            match value.options() {
                MessageOption::SkipField(field) => {
                    filtering_key.insert(field);
                }
                MessageOption::Size(field, size) => {
                    dynamic_size.insert(field, size);
                }
                MessageOption::None => (),
            };
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.values().map(|value| value.length()).sum()
    }

    fn visit(&self) -> DataType {
        DataType::Component(self)
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// An ordered, anonymous sequence of messages
pub type Trame = Vec<Box<dyn Message>>;

impl Message for Trame {
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        for value in self.iter() {
            value.write(writer)?;
        }
        Ok(())
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        for value in self.iter_mut() {
            value.read(reader)?;
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.iter().map(|value| value.length()).sum()
    }

    fn visit(&self) -> DataType {
        DataType::Trame(self)
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// A constant field, checked when read
///
/// Reading a different value than the expected one
/// fails with `InvalidConst`.
pub struct Check<T> {
    value: T,
}

impl<T> Check<T> {
    pub fn new(value: T) -> Self {
        Check { value }
    }
}

impl<T: Message + Clone + PartialEq> Message for Check<T> {
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        self.value.write(writer)
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        let expected = self.value.clone();
        self.value.read(reader)?;
        if expected != self.value {
            return Err(Error::KmsError(KmsError::new(
                KmsErrorKind::InvalidConst,
                "constant field mismatch",
            )));
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.value.length()
    }

    fn visit(&self) -> DataType {
        self.value.visit()
    }

    fn options(&self) -> MessageOption {
        MessageOption::None
    }
}

/// A message whose options depend on its value,
/// used for length prefixed fields
pub struct DynOption<T, F>
where
    T: Message,
    F: Fn(&T) -> MessageOption,
{
    inner: T,
    filter: F,
}

impl<T, F> DynOption<T, F>
where
    T: Message,
    F: Fn(&T) -> MessageOption,
{
    pub fn new(inner: T, filter: F) -> Self {
        DynOption { inner, filter }
    }
}

impl<T, F> Message for DynOption<T, F>
where
    T: Message,
    F: Fn(&T) -> MessageOption,
{
    fn write(&self, writer: &mut dyn Write) -> KmsResult<()> {
        self.inner.write(writer)
    }

    fn read(&mut self, reader: &mut dyn Read) -> KmsResult<()> {
        self.inner.read(reader)
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn visit(&self) -> DataType {
        self.inner.visit()
    }

    fn options(&self) -> MessageOption {
        (self.filter)(&self.inner)
    }
}

/// Serialize a message into a fresh buffer
pub fn to_vec(message: &dyn Message) -> KmsResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::with_capacity(message.length() as usize));
    message.write(&mut buffer)?;
    Ok(buffer.into_inner())
}

#[macro_export]
macro_rules! component {
    () => { $crate::model::data::Component::new() };
    ($( $key: expr => $val: expr ),* $(,)?) => {{
        let mut map = $crate::model::data::Component::new();
        $( map.insert(String::from($key), Box::new($val) as Box<dyn $crate::model::data::Message>); )*
        map
    }};
}

#[macro_export]
macro_rules! trame {
    () => { $crate::model::data::Trame::new() };
    ($( $val: expr ),* $(,)?) => {{
        let mut t = $crate::model::data::Trame::new();
        $( t.push(Box::new($val) as Box<dyn $crate::model::data::Message>); )*
        t
    }};
}

#[macro_export]
macro_rules! cast {
    ($ident: path, $expr: expr) => {
        match $expr.visit() {
            $ident(e) => Ok(e),
            _ => Err($crate::model::error::Error::KmsError(
                $crate::model::error::KmsError::new(
                    $crate::model::error::KmsErrorKind::InvalidCast,
                    "invalid cast",
                ),
            )),
        }
    };
}
