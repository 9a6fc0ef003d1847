//! NumPy `.npy` 文件中 `ndarray-npy` 不支持的部分
//!
//! 用 `npyz` 解析文件头并读写定长字符串数组（`<U{n}`、`|S{n}`），
//! `|O` 数组的数据段交给 [`crate::pickle`] 解码。

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use npyz::{DType, NpyFile, NpyHeader, TypeChar, TypeStr, WriterBuilder};
use thiserror::Error;

use crate::pickle::{self, PickleError, Value};

#[derive(Debug, Error)]
pub enum NpyError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("expected a 1-D array, got shape {0:?}")]
    Shape(Vec<u64>),
    #[error("unsupported dtype {0}")]
    Dtype(String),
    #[error("header declares {count} items but only {available} bytes of data follow")]
    Truncated { count: u64, available: usize },
    #[error("malformed pickle payload: {0}")]
    Pickle(#[from] PickleError),
}

/// 解析文件头，返回头部和紧随其后的数据段
fn split(bytes: &[u8]) -> Result<(NpyHeader, &[u8]), NpyError> {
    let mut data = bytes;
    let header = NpyHeader::from_reader(&mut data)?;
    Ok((header, data))
}

/// 只读取文件头
pub fn read_header(path: impl AsRef<Path>) -> Result<NpyHeader, NpyError> {
    let file = BufReader::new(File::open(path)?);
    Ok(NpyHeader::from_reader(file)?)
}

/// 读取一维字符串数组，`U` 和 `S` 两种编码都支持，末尾的 `\0` 填充会被去掉
pub fn read_strings(path: impl AsRef<Path>) -> Result<Vec<String>, NpyError> {
    let bytes = fs::read(path)?;
    let (header, data) = split(&bytes)?;

    let &[count] = header.shape() else {
        return Err(NpyError::Shape(header.shape().to_vec()));
    };
    let dtype = header.dtype();
    let is_string = match &dtype {
        DType::Plain(ty) => matches!(ty.type_char(), TypeChar::UnicodeStr | TypeChar::ByteStr),
        _ => false,
    };
    if !is_string {
        return Err(NpyError::Dtype(dtype.descr()));
    }

    // 头部中的长度不可信，先确认数据段装得下
    let needed = dtype.num_bytes().and_then(|size| (size as u64).checked_mul(count));
    if needed.is_none_or(|n| n > data.len() as u64) {
        return Err(NpyError::Truncated { count, available: data.len() });
    }

    Ok(NpyFile::with_header(header, data).into_vec::<String>()?)
}

/// 读取 `|O` 数组，返回解码后的 pickle 值（通常是一个 `ndarray` 的重建调用）
pub fn read_objects(path: impl AsRef<Path>) -> Result<Value, NpyError> {
    let bytes = fs::read(path)?;
    let (header, data) = split(&bytes)?;
    if !header.uses_pickled_array() {
        return Err(NpyError::Dtype(header.dtype().descr()));
    }
    Ok(pickle::loads(data)?)
}

/// 写入一维 `<U{n}` 字符串数组，n 为最长字符串的码位数
pub fn write_strings<S: AsRef<str>>(path: impl AsRef<Path>, items: &[S]) -> Result<(), NpyError> {
    let width = items.iter().map(|s| s.as_ref().chars().count()).max().unwrap_or(0).max(1);
    let ty: TypeStr = format!("<U{}", width)
        .parse()
        .map_err(|e: npyz::ParseTypeStrError| NpyError::Dtype(e.to_string()))?;

    let mut writer = npyz::WriteOptions::<str>::new()
        .dtype(DType::new_scalar(ty))
        .shape(&[items.len() as u64])
        .writer(BufWriter::new(File::create(path)?))
        .begin_nd()?;
    for item in items {
        writer.push(item.as_ref())?;
    }
    writer.finish()?;
    Ok(())
}
