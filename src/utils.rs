use std::path::Path;

use indicatif::ProgressStyle;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .expect("invalid progress bar template")
}

/// 根据扩展名判断是否为支持的图片格式
pub fn is_image_file(path: &Path) -> bool {
    image::ImageFormat::from_path(path).is_ok_and(|format| format.reading_enabled())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file(Path::new("ref/0001.jpg")));
        assert!(is_image_file(Path::new("query/0001.PNG")));
        assert!(!is_image_file(Path::new("query/notes.txt")));
        assert!(!is_image_file(Path::new("query/0001")));
    }
}
