use anyhow::{Result, anyhow};
use clap::Parser;
use image::GenericImageView;
use serde::Serialize;
use tokio::task::block_in_place;

use crate::Dataset;
use crate::cli::SubCommandExtend;
use crate::config::{DatasetOptions, OutputFormat, Opts};
use crate::dataset::ImageKind;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    #[command(flatten)]
    pub dataset: DatasetOptions,
    /// 图片在数据集中的下标，参考图片在前，查询图片在后
    pub index: usize,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct ImageInfo {
    index: usize,
    kind: ImageKind,
    offset: usize,
    name: String,
    path: String,
    width: u32,
    height: u32,
    color: String,
}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let dataset = block_in_place(|| self.dataset.open())?;
        let location = dataset.locate(self.index).ok_or_else(|| {
            anyhow!("下标 {} 超出范围，数据集共 {} 张图片", self.index, dataset.len())
        })?;

        let image = block_in_place(|| dataset.read_image(self.index))?;
        let (width, height) = image.dimensions();

        let info = ImageInfo {
            index: self.index,
            kind: location.kind,
            offset: location.offset,
            name: dataset.name(self.index)?.to_owned(),
            path: dataset.image_path(self.index)?.display().to_string(),
            width,
            height,
            color: format!("{:?}", image.color()),
        };

        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            OutputFormat::Table => {
                println!("index\t{}", info.index);
                println!("kind\t{} #{}", info.kind, info.offset);
                println!("name\t{}", info.name);
                println!("path\t{}", info.path);
                println!("size\t{}x{}", info.width, info.height);
                println!("color\t{}", info.color);
            }
        }
        Ok(())
    }
}
