//! Response body framing.
//!
//! The relay passes body bytes through untouched; the tracker only watches
//! them to learn where the body ends so the connection can be reused.

use std::io;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFraming {
    /// No body (HEAD, 1xx, 204, 304).
    Empty,
    Length(u64),
    Chunked,
    /// Body ends when the peer closes the connection.
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size { value: u64, digits: u32 },
    Extension { value: u64 },
    SizeLf { value: u64 },
    Data(u64),
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    FinalLf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length(u64),
    Chunked(Chunk),
    UntilClose,
    Done,
}

/// Watches relayed bytes for the end of the body.
#[derive(Debug, Clone)]
pub struct FramingTracker {
    framing: BodyFraming,
    state: State,
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl FramingTracker {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty | BodyFraming::Length(0) => State::Done,
            BodyFraming::Length(n) => State::Length(n),
            BodyFraming::Chunked => State::Chunked(Chunk::Size { value: 0, digits: 0 }),
            BodyFraming::UntilClose => State::UntilClose,
        };
        Self { framing, state }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// The whole body has been observed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// The body ends only at EOF.
    pub fn until_close(&self) -> bool {
        self.framing == BodyFraming::UntilClose
    }

    /// Observe `data`; returns how many leading bytes belong to the body.
    /// Anything after that lies beyond the end of the response.
    pub fn observe(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        match self.state {
            State::Done => Ok(0),
            State::UntilClose => Ok(data.len()),
            State::Length(remaining) => {
                let take = remaining.min(data.len() as u64);
                let left = remaining - take;
                self.state = if left == 0 { State::Done } else { State::Length(left) };
                Ok(take as usize)
            }
            State::Chunked(_) => self.observe_chunked(data),
        }
    }

    fn observe_chunked(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        let mut pos = 0;
        while pos < data.len() {
            let State::Chunked(chunk) = self.state else {
                break;
            };
            let byte = data[pos];
            let next = match chunk {
                Chunk::Size { value, digits } => match byte {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        if digits >= 16 {
                            return Err(invalid("chunk size too large"));
                        }
                        let digit = (byte as char).to_digit(16).unwrap_or(0) as u64;
                        Chunk::Size { value: value * 16 + digit, digits: digits + 1 }
                    }
                    _ if digits == 0 => return Err(invalid("invalid chunk size")),
                    b';' | b' ' | b'\t' => Chunk::Extension { value },
                    b'\r' => Chunk::SizeLf { value },
                    b'\n' => Self::after_size(value),
                    _ => return Err(invalid("invalid chunk size")),
                },
                Chunk::Extension { value } => match byte {
                    b'\r' => Chunk::SizeLf { value },
                    b'\n' => Self::after_size(value),
                    _ => Chunk::Extension { value },
                },
                Chunk::SizeLf { value } => match byte {
                    b'\n' => Self::after_size(value),
                    _ => return Err(invalid("invalid chunk header")),
                },
                Chunk::Data(remaining) => {
                    let take = remaining.min((data.len() - pos) as u64);
                    pos += take as usize;
                    let left = remaining - take;
                    self.state = State::Chunked(if left == 0 { Chunk::DataCr } else { Chunk::Data(left) });
                    continue;
                }
                Chunk::DataCr => match byte {
                    b'\r' => Chunk::DataLf,
                    b'\n' => Chunk::Size { value: 0, digits: 0 },
                    _ => return Err(invalid("missing CRLF after chunk data")),
                },
                Chunk::DataLf => match byte {
                    b'\n' => Chunk::Size { value: 0, digits: 0 },
                    _ => return Err(invalid("missing CRLF after chunk data")),
                },
                Chunk::TrailerStart => match byte {
                    b'\r' => Chunk::FinalLf,
                    b'\n' => {
                        self.state = State::Done;
                        pos += 1;
                        break;
                    }
                    _ => Chunk::TrailerLine,
                },
                Chunk::TrailerLine => match byte {
                    b'\n' => Chunk::TrailerStart,
                    _ => Chunk::TrailerLine,
                },
                Chunk::FinalLf => match byte {
                    b'\n' => {
                        self.state = State::Done;
                        pos += 1;
                        break;
                    }
                    _ => return Err(invalid("invalid last chunk")),
                },
            };
            self.state = State::Chunked(next);
            pos += 1;
        }
        Ok(pos)
    }

    fn after_size(value: u64) -> Chunk {
        if value == 0 {
            Chunk::TrailerStart
        } else {
            Chunk::Data(value)
        }
    }
}
