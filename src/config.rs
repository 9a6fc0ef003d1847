use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use clap::{Args, Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;

use crate::cli::*;
use crate::dataset::{VprDataset, VprDatasetBuilder};
use crate::error::Result;

static DATA_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    ProjectDirs::from("", "vprbench", "vprbench")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
});

static DEFAULT_GT_ROOT: LazyLock<String> =
    LazyLock::new(|| DATA_DIR.join("gt").to_string_lossy().into_owned());

fn default_gt_root() -> &'static str {
    DEFAULT_GT_ROOT.as_str()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "vprbench", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 显示数据集概况
    Info(InfoCommand),
    /// 显示单张图片的信息
    Show(ShowCommand),
    /// 显示查询图片对应的参考图片
    Matches(MatchesCommand),
    /// 检查数据集中的所有图片能否正常读取
    Check(CheckCommand),
}

#[derive(Args, Debug, Clone)]
pub struct DatasetOptions {
    /// 数据集目录，需要包含 ref 和 query 两个子目录
    /// 默认为 <数据目录>/datasets/<VARIANT>
    #[arg(short, long, value_name = "DIR", verbatim_doc_comment)]
    pub dataset_root: Option<PathBuf>,
    /// 真值目录，其中 <VARIANT>/ 子目录存放图片名列表和真值
    #[arg(short, long, value_name = "DIR", default_value = default_gt_root())]
    pub gt_root: PathBuf,
    /// 数据集名称
    #[arg(long, value_name = "VARIANT", default_value = "CrossSeason")]
    pub variant: String,
}

impl DatasetOptions {
    pub fn dataset_root(&self) -> PathBuf {
        match &self.dataset_root {
            Some(root) => root.clone(),
            None => DATA_DIR.join("datasets").join(&self.variant),
        }
    }

    pub fn gt_store(&self) -> GtStore {
        GtStore::new(&self.gt_root, &self.variant)
    }

    pub fn open(&self) -> Result<VprDataset> {
        VprDatasetBuilder::new(self.dataset_root(), self.gt_store()).open()
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

/// 图片名列表和真值的存放位置
///
/// ```text
/// <root>/<variant>/<variant>_dbImages.npy
/// <root>/<variant>/<variant>_qImages.npy
/// <root>/<variant>/<variant>_gt.npy (或 <variant>_gt.json)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtStore {
    root: PathBuf,
    variant: String,
}

impl GtStore {
    pub fn new(root: impl Into<PathBuf>, variant: impl Into<String>) -> Self {
        Self { root: root.into(), variant: variant.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.variant)
    }

    /// 返回参考图片名列表的路径
    pub fn db_images(&self) -> PathBuf {
        self.dir().join(format!("{}_dbImages.npy", self.variant))
    }

    /// 返回查询图片名列表的路径
    pub fn q_images(&self) -> PathBuf {
        self.dir().join(format!("{}_qImages.npy", self.variant))
    }

    /// 返回真值文件的路径，`.npy` 不存在而 `.json` 存在时使用后者
    pub fn ground_truth(&self) -> PathBuf {
        let npy = self.dir().join(format!("{}_gt.npy", self.variant));
        if npy.exists() {
            return npy;
        }
        let json = npy.with_extension("json");
        if json.exists() { json } else { npy }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_gt_store_paths() {
        let store = GtStore::new("/data/gt", "CrossSeason");
        assert_eq!(store.db_images(), Path::new("/data/gt/CrossSeason/CrossSeason_dbImages.npy"));
        assert_eq!(store.q_images(), Path::new("/data/gt/CrossSeason/CrossSeason_qImages.npy"));
        assert_eq!(store.ground_truth(), Path::new("/data/gt/CrossSeason/CrossSeason_gt.npy"));
    }

    #[test]
    fn test_gt_store_json_fallback() {
        let dir = TempDir::new().unwrap();
        let store = GtStore::new(dir.path(), "Nordland");
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join("Nordland_gt.json"), "[]").unwrap();
        assert_eq!(store.ground_truth(), store.dir().join("Nordland_gt.json"));

        std::fs::write(store.dir().join("Nordland_gt.npy"), b"").unwrap();
        assert_eq!(store.ground_truth(), store.dir().join("Nordland_gt.npy"));
    }

    #[test]
    fn test_default_dataset_root() {
        let opts = Opts::parse_from(["vprbench", "info", "--variant", "Nordland"]);
        let SubCommand::Info(info) = opts.subcmd else { panic!("expected info") };
        assert!(info.dataset.dataset_root().ends_with("datasets/Nordland"));
        assert!(info.dataset.gt_root.ends_with("gt"));
    }
}
