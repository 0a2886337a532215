pub mod checkpoint;
pub mod config;
pub mod decimal;
pub mod driver;
pub mod error;
pub mod mysql;
pub mod pipeline;
pub mod queue;

pub use config::Config;
pub use decimal::Decimal;
pub use driver::{create_driver, BinlogDriver, BinlogPosition, DriverOptions, NullDriver, TcpDriver};
pub use error::{DecimalError, Error, ErrorCode, Result};
pub use mysql::{BinlogEvent, Converter, EventData, EventType, RowFieldSet, Value};
pub use pipeline::{BinaryLog, ContentHandler};
