use std::path::Path;
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;
use crate::core::Result;

/// 可读前缀的最大长度，避免生成超长文件名
const READABLE_PREFIX_LEN: usize = 50;

/// 将可能带路径的 file_id 转换为安全的文件名
///
/// 保留去掉分隔符的可读前缀，并追加原始标识符 MD5 的前 8 位，
/// 保证不同的标识符映射到不同的名字。
pub fn sanitize_file_id(file_id: &str) -> String {
    let digest = hex::encode(Md5::digest(file_id.as_bytes()));

    // 去除路径分隔符和上级目录片段
    let readable = file_id.replace(['/', '\\'], "_").replace("..", "_");
    let readable: String = readable.chars().take(READABLE_PREFIX_LEN).collect();

    format!("{}_{}", readable, &digest[..8])
}

/// 计算一段内存数据的 MD5（十六进制小写）
pub fn bytes_md5(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// 流式计算文件内容的 MD5
pub async fn file_md5(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_md5_known_vector() {
        assert_eq!(bytes_md5(b"hello"), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(bytes_md5(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_sanitize_strips_separators() {
        let safe = sanitize_file_id("photos/2024/img.png");
        assert!(!safe.contains('/'));
        assert!(safe.starts_with("photos_2024_img.png_"));
    }

    #[test]
    fn test_sanitize_strips_parent_segments() {
        let safe = sanitize_file_id("../../etc/passwd");
        assert!(!safe.contains(".."));
        assert!(!safe.contains('/'));
    }

    #[test]
    fn test_sanitize_collision_freedom() {
        // 仅分隔符不同的标识符必须映射到不同的名字
        let a = sanitize_file_id("a/b/c");
        let b = sanitize_file_id("a_b_c");
        assert_ne!(a, b);

        // 超过截断阈值后仅尾部不同的标识符也必须不同
        let long_a = format!("{}x", "p".repeat(60));
        let long_b = format!("{}y", "p".repeat(60));
        assert_ne!(sanitize_file_id(&long_a), sanitize_file_id(&long_b));
    }

    #[test]
    fn test_sanitize_truncates_readable_prefix() {
        let long = "z".repeat(200);
        let safe = sanitize_file_id(&long);
        // 50 个字符的前缀 + '_' + 8 位哈希
        assert_eq!(safe.len(), 50 + 1 + 8);
    }

    #[tokio::test]
    async fn test_file_md5_matches_bytes_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"wharf test payload").await.unwrap();

        let from_file = file_md5(&path).await.unwrap();
        assert_eq!(from_file, bytes_md5(b"wharf test payload"));
    }
}
