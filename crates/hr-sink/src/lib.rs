//! HookRelay Sink Connector
//!
//! A shared, session-holding client for the external record store:
//! - `SinkConnector`: lazy connection, reconnect-once on an expired session,
//!   create/update/delete/query and atomic unit-of-work commits
//! - `SinkTransport`: the wire seam, implemented over REST by `RestSinkTransport`
//! - `UnitOfWork`: batched operations with placeholder references between them

pub mod connector;
pub mod rest;
pub mod transport;
pub mod unit_of_work;

pub use connector::SinkConnector;
pub use rest::RestSinkTransport;
pub use transport::{Session, SinkTransport};
pub use unit_of_work::{Operation, UnitOfWork};

pub use hr_common::{
    FieldError, Fields, QueryResult, RecordResult, ReferenceId, SaveResult, SinkError, SinkRecord,
};
