pub mod error;
pub mod ids;
pub mod pool;

pub use error::{CoreError, ErrorKind};
pub use ids::{CredentialId, RequestId};
pub use pool::{Pool, Poolable};
