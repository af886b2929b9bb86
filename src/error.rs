//! 错误类型
//!
//! 按失败性质划分：数据不变量被破坏、数值退化、解码模式非法、
//! 检查点形状不匹配、配置错误，以及外部协作者（文件、JSON、bincode）的失败。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaeError {
    /// 数据集损坏：零长度字幕、越界 token、词表不稠密等。不可重试。
    #[error("数据无效: {0}")]
    InvalidData(String),

    /// NaN 损失、整行被掩码的注意力等。出现即说明存在 bug。
    #[error("数值退化: {0}")]
    NumericalDegeneracy(String),

    #[error("解码模式非法: {0}")]
    InvalidDecodeMode(String),

    #[error("参数 {name} 形状不匹配: 期望 {expected:?}，实际 {found:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode 编码错误: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("bincode 解码错误: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

pub type Result<T> = std::result::Result<T, DaeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaeError::InvalidData("第 3 条字幕长度为 0".to_string());
        assert!(format!("{}", err).contains("数据无效"));
        assert!(format!("{}", err).contains("第 3 条"));

        let err = DaeError::ShapeMismatch {
            name: "fc.weight".to_string(),
            expected: (4, 5),
            found: (5, 4),
        };
        let text = format!("{}", err);
        assert!(text.contains("fc.weight"));
        assert!(text.contains("(4, 5)"));
    }

    #[test]
    fn test_io_error_converts() {
        fn open_missing() -> Result<String> {
            Ok(std::fs::read_to_string("/definitely/not/here.json")?)
        }
        assert!(matches!(open_missing(), Err(DaeError::Io(_))));
    }
}
