use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = DatasetError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DatasetError {
    /// 数据集目录不存在或结构不完整，构造时立即失败
    #[error("invalid dataset configuration: {0}")]
    Config(String),

    /// 真值文件缺失或损坏，构造时立即失败
    #[error("failed to load {}: {reason}", .path.display())]
    Deserialize { path: PathBuf, reason: String },

    /// 以下错误只影响当次访问
    #[error("image not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("index {index} out of range for dataset of length {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("transform failed on index {index}: {source}")]
    Transform {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
}

impl DatasetError {
    pub(crate) fn deserialize(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Deserialize { path: path.into(), reason: reason.to_string() }
    }

    /// 是否为只影响单次访问的错误
    pub fn is_access_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Decode { .. }
                | Self::OutOfRange { .. }
                | Self::Transform { .. }
        )
    }
}
