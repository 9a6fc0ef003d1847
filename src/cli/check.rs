use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{info, warn};
use rayon::prelude::*;
use tokio::task::block_in_place;
use walkdir::WalkDir;

use crate::cli::SubCommandExtend;
use crate::config::{DatasetOptions, Opts};
use crate::dataset::{QUERY_DIR, REF_DIR, VprDataset};
use crate::utils::{is_image_file, pb_style};
use crate::{Dataset, DatasetError};

#[derive(Parser, Debug, Clone)]
pub struct CheckCommand {
    #[command(flatten)]
    pub dataset: DatasetOptions,
    /// 同时列出 ref 和 query 目录下未被引用的图片
    #[arg(long)]
    pub orphans: bool,
}

impl SubCommandExtend for CheckCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let dataset = block_in_place(|| self.dataset.open())?;

        let failures = block_in_place(|| check_images(&dataset));
        for (index, err) in &failures {
            println!("[ERR] {} {}: {}", index, dataset.name(*index)?, err);
        }

        if self.orphans {
            for path in block_in_place(|| find_orphans(&dataset)) {
                warn!("unreferenced image: {}", path.display());
                println!("[ORPHAN] {}", path.display());
            }
        }

        if !failures.is_empty() {
            return Err(anyhow!("{} / {} 张图片读取失败", failures.len(), dataset.len()));
        }
        info!("{} 张图片检查完成", dataset.len());
        Ok(())
    }
}

/// 并行读取所有图片，返回读取失败的下标和错误
fn check_images(dataset: &VprDataset) -> Vec<(usize, DatasetError)> {
    let pb = ProgressBar::new(dataset.len() as u64).with_style(pb_style());

    let mut failures = (0..dataset.len())
        .into_par_iter()
        .progress_with(pb.clone())
        .filter_map(|index| dataset.get(index).err().map(|err| (index, err)))
        .collect::<Vec<_>>();
    failures.sort_unstable_by_key(|(index, _)| *index);

    pb.finish_and_clear();
    failures
}

/// 找出数据集目录下存在、但没有出现在图片名列表中的图片
fn find_orphans(dataset: &VprDataset) -> Vec<PathBuf> {
    let root = dataset.root();
    let known = dataset
        .references()
        .iter()
        .chain(dataset.queries())
        .map(PathBuf::from)
        .collect::<HashSet<_>>();

    let mut orphans = [REF_DIR, QUERY_DIR]
        .into_iter()
        .flat_map(|dir| WalkDir::new(root.join(dir)).into_iter().filter_map(|entry| entry.ok()))
        .filter(|entry| entry.file_type().is_file() && is_image_file(entry.path()))
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(PathBuf::from))
        .filter(|path| !known.contains(path))
        .collect::<Vec<_>>();
    orphans.sort();
    orphans
}
