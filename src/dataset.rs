use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageError, ImageReader};
use log::{debug, info};
use serde::Serialize;

use crate::config::GtStore;
use crate::error::{DatasetError, Result};
use crate::ground_truth::GroundTruth;
use crate::npy;
use crate::transform::Transform;

pub const REF_DIR: &str = "ref";
pub const QUERY_DIR: &str = "query";

/// 可按下标随机访问、长度已知的数据集
pub trait Dataset<I>: Send + Sync {
    fn get(&self, index: usize) -> Result<I>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按顺序访问所有元素，单个元素的错误不会中断迭代
    fn iter(&self) -> DatasetIterator<'_, I>
    where
        Self: Sized,
    {
        DatasetIterator::new(self)
    }
}

pub struct DatasetIterator<'a, I> {
    current: usize,
    dataset: &'a dyn Dataset<I>,
}

impl<'a, I> DatasetIterator<'a, I> {
    pub fn new<D: Dataset<I>>(dataset: &'a D) -> Self {
        Self { current: 0, dataset }
    }
}

impl<I> Iterator for DatasetIterator<'_, I> {
    type Item = Result<I>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.dataset.len() {
            return None;
        }
        let item = self.dataset.get(self.current);
        self.current += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.len().saturating_sub(self.current);
        (remaining, Some(remaining))
    }
}

impl<I> ExactSizeIterator for DatasetIterator<'_, I> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Reference,
    Query,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => f.write_str("reference"),
            Self::Query => f.write_str("query"),
        }
    }
}

/// 统一下标在参考列表或查询列表中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub kind: ImageKind,
    pub offset: usize,
}

/// 视觉位置识别数据集
///
/// 参考图片在前、查询图片在后拼接成一个序列，下标 `i < num_references` 为参考图片，
/// 否则为第 `i - num_references` 张查询图片。构造完成后所有列表都不再变化。
pub struct VprDataset {
    root: PathBuf,
    /// 参考图片名 + 查询图片名
    images: Vec<String>,
    num_references: usize,
    ground_truth: GroundTruth,
    transform: Option<Box<dyn Transform>>,
}

impl VprDataset {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn num_references(&self) -> usize {
        self.num_references
    }

    pub fn num_queries(&self) -> usize {
        self.images.len() - self.num_references
    }

    pub fn references(&self) -> &[String] {
        &self.images[..self.num_references]
    }

    pub fn queries(&self) -> &[String] {
        &self.images[self.num_references..]
    }

    pub fn ground_truth(&self) -> &GroundTruth {
        &self.ground_truth
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    pub fn locate(&self, index: usize) -> Option<ImageRef> {
        if index < self.num_references {
            Some(ImageRef { kind: ImageKind::Reference, offset: index })
        } else if index < self.images.len() {
            Some(ImageRef { kind: ImageKind::Query, offset: index - self.num_references })
        } else {
            None
        }
    }

    /// 查询图片在统一序列中的下标
    pub fn query_index(&self, query: usize) -> Option<usize> {
        (query < self.num_queries()).then(|| self.num_references + query)
    }

    pub fn name(&self, index: usize) -> Result<&str> {
        self.images
            .get(index)
            .map(String::as_str)
            .ok_or(DatasetError::OutOfRange { index, len: self.images.len() })
    }

    pub fn image_path(&self, index: usize) -> Result<PathBuf> {
        Ok(self.root.join(self.name(index)?))
    }

    /// 读取并解码图片，不应用变换
    pub fn read_image(&self, index: usize) -> Result<DynamicImage> {
        let path = self.image_path(index)?;
        debug!("reading #{} from {}", index, path.display());

        let reader = match ImageReader::open(&path) {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(DatasetError::NotFound(path)),
            Err(e) => return Err(DatasetError::Decode { path, source: ImageError::IoError(e) }),
        };
        let reader = match reader.with_guessed_format() {
            Ok(reader) => reader,
            Err(e) => return Err(DatasetError::Decode { path, source: ImageError::IoError(e) }),
        };
        reader.decode().map_err(|source| DatasetError::Decode { path, source })
    }
}

impl Dataset<(DynamicImage, usize)> for VprDataset {
    fn get(&self, index: usize) -> Result<(DynamicImage, usize)> {
        let image = self.read_image(index)?;
        let image = match &self.transform {
            Some(transform) => transform
                .apply(image)
                .map_err(|source| DatasetError::Transform { index, source })?,
            None => image,
        };
        Ok((image, index))
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

impl fmt::Debug for VprDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VprDataset")
            .field("root", &self.root)
            .field("num_references", &self.num_references)
            .field("num_queries", &self.num_queries())
            .field("has_transform", &self.has_transform())
            .finish_non_exhaustive()
    }
}

pub struct VprDatasetBuilder {
    root: PathBuf,
    store: GtStore,
    transform: Option<Box<dyn Transform>>,
}

impl VprDatasetBuilder {
    /// # Arguments
    ///
    /// * `root` - 数据集目录，需要包含 `ref` 和 `query` 两个子目录
    /// * `store` - 图片名列表和真值所在位置
    pub fn new(root: impl Into<PathBuf>, store: GtStore) -> Self {
        Self { root: root.into(), store, transform: None }
    }

    /// 设置每次读取图片后应用的变换
    pub fn transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn open(self) -> Result<VprDataset> {
        let root = self.root;
        if !root.exists() {
            return Err(DatasetError::Config(format!(
                "dataset root {} does not exist",
                root.display()
            )));
        }
        for dir in [REF_DIR, QUERY_DIR] {
            if !root.join(dir).is_dir() {
                return Err(DatasetError::Config(format!(
                    "directory '{}' is missing in {}",
                    dir,
                    root.display()
                )));
            }
        }

        let load_names = |path: PathBuf| {
            debug!("loading image names from {}", path.display());
            npy::read_strings(&path).map_err(|e| DatasetError::deserialize(path, e))
        };
        let mut images = load_names(self.store.db_images())?;
        let queries = load_names(self.store.q_images())?;
        let num_references = images.len();
        let num_queries = queries.len();
        images.extend(queries);

        let gt_path = self.store.ground_truth();
        let ground_truth = GroundTruth::load(&gt_path)?;
        ground_truth
            .validate(num_references, num_queries)
            .map_err(|e| DatasetError::deserialize(gt_path, e))?;

        info!(
            "loaded {}: {} references, {} queries",
            self.store.variant(),
            num_references,
            num_queries
        );

        Ok(VprDataset { root, images, num_references, ground_truth, transform: self.transform })
    }
}
