// Buffers for reading and writing dns packets

use std::collections::BTreeMap;

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    #[display(fmt = "I/O Error: {}", _0)]
    Io(std::io::Error),
    #[display(fmt = "End of buffer reached")]
    EndOfBuffer,
    #[display(fmt = "Invalid buffer access at position {}", _0)]
    InvalidBufferAccess(#[error(not(source))] usize),
    #[display(fmt = "Label exceeds 63 octets")]
    LabelTooLong,
}

type Result<T> = std::result::Result<T, BufferError>;

pub trait PacketBuffer {
    /// Reads the next byte from the buffer.
    fn read(&mut self) -> Result<u8>;

    /// Reads a 16-bit value from the buffer.
    fn read_u16(&mut self) -> Result<u16> {
        Ok(((self.read()? as u16) << 8) | (self.read()? as u16))
    }

    /// Reads a 32-bit value from the buffer.
    fn read_u32(&mut self) -> Result<u32> {
        Ok(((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32))
    }

    /// Reads a domain name (QNAME) from the buffer.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            // Two byte sequence where the highest two bits of the first byte
            // are set represents a jump to an offset relative to the start of
            // the buffer. The shared position is only moved past the pointer
            // itself, never to the jump destination.
            if (len & 0xC0) == 0xC0 {
                if !jumped {
                    self.seek(pos + 2)?;
                }
                let offset = (((len as u16) ^ 0xC0) << 8) | self.get(pos + 1)? as u16;
                pos = offset as usize;
                jumped = true;
                continue;
            }

            // Names are terminated by an empty label of length 0.
            if len == 0 {
                break;
            }

            pos += 1;

            let label_bytes = self.get_range(pos, len as usize)?;
            outstr.push_str(delim);
            outstr.push_str(&String::from_utf8_lossy(label_bytes));
            delim = ".";
            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }
        Ok(())
    }

    /// Writes a single byte at the current position.
    fn write(&mut self, val: u8) -> Result<()>;

    /// Writes a single byte to the buffer.
    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    /// Writes a 16-bit value to the buffer.
    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;
        Ok(())
    }

    /// Writes a 32-bit value to the buffer.
    fn write_u32(&mut self, val: u32) -> Result<()> {
        for i in (0..4).rev() {
            self.write(((val >> (i * 8)) & 0xFF) as u8)?;
        }
        Ok(())
    }

    /// Writes a domain name (QNAME) to the buffer, emitting a jump pointer
    /// when a previously written suffix can be reused.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let split: Vec<&str> = qname.split('.').filter(|l| !l.is_empty()).collect();

        let mut labels_left = &split[..];
        while !labels_left.is_empty() {
            let suffix = labels_left.join(".");
            if let Some(prev) = self.find_label(&suffix) {
                let jump = 0xC000 | (prev as u16);
                self.write_u16(jump)?;
                return Ok(());
            }

            let pos = self.pos();
            self.save_label(&suffix, pos);

            let label = labels_left[0];
            if label.len() > 63 {
                return Err(BufferError::LabelTooLong);
            }
            self.write_u8(label.len() as u8)?;
            for &b in label.as_bytes() {
                self.write_u8(b)?;
            }
            labels_left = &labels_left[1..];
        }
        self.write_u8(0) // Null-terminate QNAME
    }

    /// Gets the byte at a specific position.
    fn get(&mut self, pos: usize) -> Result<u8>;

    /// Gets a range of bytes starting from a specific position.
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;

    /// Finds a saved label's position.
    fn find_label(&self, label: &str) -> Option<usize>;

    /// Saves a label at the given position.
    fn save_label(&mut self, label: &str, pos: usize);

    /// Seeks a specific position in the buffer.
    fn seek(&mut self, pos: usize) -> Result<()>;

    /// Moves the position by a specific number of steps.
    fn step(&mut self, steps: usize) -> Result<()>;

    /// Returns the current position in the buffer.
    fn pos(&self) -> usize;

    /// Sets a byte at a specific position.
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;

    /// Sets a 16-bit value at a specific position.
    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: BTreeMap<String, usize>,
}

impl VectorPacketBuffer {
    /// Creates a new `VectorPacketBuffer` with a default initial capacity.
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::with_capacity(512),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }

    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        self.buffer.push(val);
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buffer[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;

        Ok(())
    }
}

/// Fixed 512 byte buffer matching the classic UDP payload limit.
pub struct BytePacketBuffer {
    pub buf: [u8; 512],
    pub pos: usize,
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        BytePacketBuffer::new()
    }
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; 512],
            pos: 0,
        }
    }

    /// Wraps received datagram bytes for parsing.
    pub fn from_bytes(data: &[u8]) -> BytePacketBuffer {
        let mut buffer = BytePacketBuffer::new();
        let len = data.len().min(512);
        buffer.buf[..len].copy_from_slice(&data[..len]);
        buffer
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}

    fn read(&mut self) -> Result<u8> {
        if self.pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= 512 {
            return Err(BufferError::InvalidBufferAccess(pos));
        }
        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > 512 {
            return Err(BufferError::InvalidBufferAccess(start + len));
        }
        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[self.pos] = val;
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= 512 {
            return Err(BufferError::InvalidBufferAccess(pos));
        }
        self.buf[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > 512 {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > 512 {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;

        Ok(())
    }
}
