pub mod backend;
pub mod definition;
pub mod instance;
pub mod library;
pub mod locator;
pub mod memory;

pub mod errors {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum BlockError {
        #[error("{operation}: invalid input for `{parameter}`")]
        InvalidArgument {
            operation: &'static str,
            parameter: &'static str,
        },
        #[error("{operation}: coordinate frame `{parameter}` is sheared")]
        ShearedFrame {
            operation: &'static str,
            parameter: &'static str,
        },
        #[error("file not found: {0}")]
        FileNotFound(String),
        #[error("block `{name}` does not exist in the current document")]
        DoesNotExist { name: String },
        #[error("{operation} failed")]
        OperationFailed { operation: &'static str },
        #[error("{operation}: no block backend is bound")]
        BackendUnavailable { operation: &'static str },
    }

    impl BlockError {
        /// 参数错误（含错切坐标系），在调用后端之前就已判定。
        pub fn is_invalid_argument(&self) -> bool {
            matches!(
                self,
                BlockError::InvalidArgument { .. } | BlockError::ShearedFrame { .. }
            )
        }
    }
}

pub use backend::GeometryBackend;
pub use definition::{Availability, Block};
pub use errors::BlockError;
pub use instance::BlockInstance;
pub use library::BlockLibrary;
pub use locator::{FileLocator, SearchPathLocator};
pub use memory::MemoryBackend;
