mod read_buf;

pub use read_buf::ReadBuf;
