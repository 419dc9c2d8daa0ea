//! Client SDK for a Parse-compatible backend.
//!
//! Every remote operation returns a [`Deferred`], a shareable deferred
//! result that supports chained continuations and can also be awaited.
//!
//! ## Features
//!
//! - **Deferred results**: `then`/`and_then`/`or_else` chaining, `all`, legacy callbacks
//! - **Queries**: fluent [`Query`] builder sent as a single filter expression
//! - **Records**: untyped [`Record`]s with field operations, batches, and events
//! - **Accounts**: users, sessions, roles, ACLs
//! - **Services**: files, cloud functions, outbound HTTP, push, analytics, remote config

mod acl;
mod analytics;
mod client;
mod cloud;
mod config;
pub mod deferred;
mod error;
mod file;
mod geo;
mod installation;
mod push;
mod query;
mod record;
mod relation;
mod remote_config;
mod role;
pub mod types;
mod user;

pub use acl::Acl;
pub use client::{Client, RecordEvent, RecordEventKind};
pub use cloud::{Cookie, HttpBody, HttpOptions, HttpResponse};
pub use config::{ClientConfig, ClientConfigBuilder, DEFAULT_SERVER_URL, RequestOptions};
pub use deferred::{Callbacks, Deferred, Outcome, Resolver};
pub use error::{ErrorCode, NimbusError};
pub use file::{FileUpload, StoredFile};
pub use geo::{EARTH_RADIUS_KM, EARTH_RADIUS_MILES, GeoPoint};
pub use installation::Installation;
pub use push::PushData;
pub use query::{EachOptions, Query};
pub use record::{Record, RecordKind, Schema};
pub use relation::Relation;
pub use remote_config::RemoteConfig;
pub use role::Role;
pub use types::{FieldOp, Pointer};
pub use user::{Session, User, is_revocable_token};
