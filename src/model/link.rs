use crate::model::data::{to_vec, Message};
use crate::model::error::KmsResult;
use std::io::{Read, Write};

/// Link layer is a wrapper around a blocking stream,
/// a TCP socket on the server or an in memory cursor in tests
pub struct Link<S> {
    stream: S,
}

impl<S: Read + Write> Link<S> {
    /// Create a new link layer from a stream
    ///
    /// # Example
    /// ```
    /// use kms::model::link::Link;
    /// use std::io::Cursor;
    /// let link = Link::new(Cursor::new(vec![]));
    /// ```
    pub fn new(stream: S) -> Self {
        Link { stream }
    }

    /// This method is designed to write a Message
    ///
    /// # Example
    /// ```
    /// # #[macro_use]
    /// # extern crate kms;
    /// # use kms::model::data::U32;
    /// # use kms::model::link::Link;
    /// # use std::io::Cursor;
    /// # fn main() {
    ///     let mut link = Link::new(Cursor::new(vec![]));
    ///     link.write(&component![
    ///         "foo" => U32::LE(1)
    ///     ]).unwrap();
    ///
    ///     assert_eq!(link.get_ref().get_ref(), &[1, 0, 0, 0])
    /// # }
    /// ```
    pub fn write(&mut self, message: &dyn Message) -> KmsResult<()> {
        let buffer = to_vec(message)?;
        self.write_raw(&buffer)
    }

    /// Write an already framed buffer to the stream
    pub fn write_raw(&mut self, buffer: &[u8]) -> KmsResult<()> {
        self.stream.write_all(buffer)?;
        self.stream.flush()?;
        Ok(())
    }

    /// This function will block until the expected size has been read
    ///
    /// # Example
    /// ```
    /// use kms::model::link::Link;
    /// use std::io::Cursor;
    /// let mut link = Link::new(Cursor::new(vec![0, 1, 2]));
    /// assert_eq!(link.read(2).unwrap(), [0, 1])
    /// ```
    pub fn read(&mut self, expected_size: usize) -> KmsResult<Vec<u8>> {
        let mut buffer = vec![0; expected_size];
        self.stream.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}
