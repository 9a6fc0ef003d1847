#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use ndarray::array;
use ndarray_npy::write_npy;
use tempfile::TempDir;
use vprbench::GtStore;
use vprbench::npy::write_strings;

pub const VARIANT: &str = "CrossSeason";

/// (名称, 宽, 高, 颜色)
pub const REFERENCES: [(&str, u32, u32, [u8; 3]); 3] = [
    ("ref/0000.png", 4, 3, [255, 0, 0]),
    ("ref/0001.png", 5, 3, [0, 255, 0]),
    ("ref/0002.png", 6, 3, [0, 0, 255]),
];

pub const QUERIES: [(&str, u32, u32, [u8; 3]); 2] =
    [("query/0000.png", 7, 5, [10, 20, 30]), ("query/0001.png", 8, 5, [40, 50, 60])];

/// 一个完整的临时数据集：图片目录 + 真值目录
pub struct TestDataset {
    pub dir: TempDir,
    pub root: PathBuf,
    pub store: GtStore,
}

impl TestDataset {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("dataset");
        let store = GtStore::new(dir.path().join("gt"), VARIANT);

        fs::create_dir_all(root.join("ref")).unwrap();
        fs::create_dir_all(root.join("query")).unwrap();
        fs::create_dir_all(store.dir()).unwrap();

        for (name, w, h, color) in REFERENCES.iter().chain(QUERIES.iter()) {
            RgbImage::from_pixel(*w, *h, Rgb(*color)).save(root.join(name)).unwrap();
        }

        let refs = REFERENCES.iter().map(|r| r.0).collect::<Vec<_>>();
        let queries = QUERIES.iter().map(|q| q.0).collect::<Vec<_>>();
        write_strings(store.db_images(), &refs).unwrap();
        write_strings(store.q_images(), &queries).unwrap();
        write_npy(store.dir().join(format!("{}_gt.npy", VARIANT)), &array![[0i64, 1], [2, -1]])
            .unwrap();

        Self { dir, root, store }
    }

    pub fn gt_root(&self) -> &Path {
        self.store.root()
    }

    /// 用 `tests/data` 中 `np.save` 格式的不等长 object 数组替换真值
    pub fn use_object_ground_truth(&self, fixture: &str) {
        let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(fixture);
        fs::copy(src, self.store.dir().join(format!("{}_gt.npy", VARIANT))).unwrap();
    }
}
