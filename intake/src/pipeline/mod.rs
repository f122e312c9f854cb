//! The upload-then-publish pipeline.
//!
//! For one request: derive a storage key per attached file ([`keys`]), assemble the payload that
//! describes the request ([`payload`]), store every file ([`uploads`]), and only once all of them
//! are durable publish the payload ([`handler`]). A queue consumer therefore never sees a key whose
//! object is missing.

pub mod errors;
pub mod handler;
pub mod keys;
pub mod payload;
pub mod uploads;

pub use errors::{FileUploadFailure, IntakeError, UploadError};
pub use handler::{IntakeRequest, IntakeStage, RequestHandler};
pub use keys::{KeyDerivationError, StorageKey, derive_key};
pub use payload::{FileDescriptor, Payload};
pub use uploads::{AttachedFile, upload_all};
