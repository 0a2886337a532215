pub mod connection;
pub mod converter;
pub mod decoder;
pub mod reassembly;
pub mod rows;
pub mod types;
pub mod value;
pub mod wire;

#[cfg(test)]
pub mod test_utils;

pub use connection::{Handshake, MysqlConnection};
pub use converter::Converter;
pub use decoder::BinlogDecoder;
pub use reassembly::{Frame, PacketAssembler};
pub use rows::{RowFieldSet, RowOfFields, TableMapCache};
pub use types::*;
pub use value::Value;
