use image::DynamicImage;

/// 读取图片后对图片进行的变换，例如缩放、归一化
///
/// 数据集可能被多个线程同时访问，因此变换需要是 `Send + Sync` 的
pub trait Transform: Send + Sync {
    fn apply(&self, image: DynamicImage) -> anyhow::Result<DynamicImage>;
}

impl<F> Transform for F
where
    F: Fn(DynamicImage) -> anyhow::Result<DynamicImage> + Send + Sync,
{
    fn apply(&self, image: DynamicImage) -> anyhow::Result<DynamicImage> {
        self(image)
    }
}
