use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;
use ndarray::{ArrayD, Ix1, Ix2};
use ndarray_npy::{ReadableElement, read_npy};
use npyz::{DType, Endianness, TypeChar, TypeStr};
use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};
use crate::npy;
use crate::pickle::Value;

/// 每个查询图片对应的正确参考图片编号
///
/// 第 i 项对应第 i 张查询图片，编号为参考图片在参考列表中的下标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroundTruth(Vec<Vec<u32>>);

impl GroundTruth {
    pub fn new(matches: Vec<Vec<u32>>) -> Self {
        Self(matches)
    }

    /// 从文件中加载真值，根据扩展名选择格式
    ///
    /// * `.npy`：`np.save` 保存的 object 数组，每个查询一个整数数组，长度不等；
    ///   或整数数组，一维时每个查询一个匹配，二维时每行一个查询，负数视为填充
    /// * `.json`：二维整数列表
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading ground truth from {}", path.display());
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => Self::load_json(path),
            _ => Self::load_npy(path),
        }
    }

    fn load_json(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| DatasetError::deserialize(path, e))?;
        let matches: Vec<Vec<u32>> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| DatasetError::deserialize(path, e))?;
        Ok(Self(matches))
    }

    fn load_npy(path: &Path) -> Result<Self> {
        let header = npy::read_header(path).map_err(|e| DatasetError::deserialize(path, e))?;
        if header.uses_pickled_array() {
            debug!("{} is a pickled object array", path.display());
            let value = npy::read_objects(path).map_err(|e| DatasetError::deserialize(path, e))?;
            let matches =
                ragged_from_pickle(&value).map_err(|e| DatasetError::deserialize(path, e))?;
            return Ok(Self(matches));
        }

        let dtype = header.dtype();
        let unsupported =
            || DatasetError::deserialize(path, format!("unsupported dtype {}", dtype.descr()));
        let DType::Plain(ty) = &dtype else {
            return Err(unsupported());
        };
        let matches = match (ty.type_char(), ty.size_field()) {
            (TypeChar::Int, 1) => read_rows::<i8>(path, i64::from)?,
            (TypeChar::Int, 2) => read_rows::<i16>(path, i64::from)?,
            (TypeChar::Int, 4) => read_rows::<i32>(path, i64::from)?,
            (TypeChar::Int, 8) => read_rows::<i64>(path, |v| v)?,
            (TypeChar::Uint, 1) => read_rows::<u8>(path, i64::from)?,
            (TypeChar::Uint, 2) => read_rows::<u16>(path, i64::from)?,
            (TypeChar::Uint, 4) => read_rows::<u32>(path, i64::from)?,
            (TypeChar::Uint, 8) => {
                read_rows::<u64>(path, |v| i64::try_from(v).unwrap_or(i64::MAX))?
            }
            _ => return Err(unsupported()),
        };
        Ok(Self(matches))
    }

    /// 检查真值与参考/查询列表是否一致
    pub fn validate(&self, num_references: usize, num_queries: usize) -> Result<(), String> {
        if self.0.len() != num_queries {
            return Err(format!(
                "ground truth has {} entries but there are {} queries",
                self.0.len(),
                num_queries
            ));
        }
        for (query, matches) in self.0.iter().enumerate() {
            if let Some(&bad) = matches.iter().find(|&&i| i as usize >= num_references) {
                return Err(format!(
                    "query {} matches reference {} but there are only {} references",
                    query, bad, num_references
                ));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 返回查询图片对应的参考图片编号
    pub fn matches(&self, query: usize) -> Option<&[u32]> {
        self.0.get(query).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u32]> {
        self.0.iter().map(Vec::as_slice)
    }

    /// 所有查询的匹配总数
    pub fn total_matches(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }
}

fn read_rows<T>(path: &Path, to_i64: impl Fn(T) -> i64) -> Result<Vec<Vec<u32>>>
where
    T: ReadableElement + Copy,
{
    let array: ArrayD<T> = read_npy(path).map_err(|e| DatasetError::deserialize(path, e))?;

    let to_index = |v: T| -> Result<Option<u32>> {
        match to_i64(v) {
            // 负数为填充值
            v if v < 0 => Ok(None),
            v => u32::try_from(v)
                .map(Some)
                .map_err(|_| DatasetError::deserialize(path, format!("index {} too large", v))),
        }
    };

    match array.ndim() {
        1 => {
            let array = array
                .into_dimensionality::<Ix1>()
                .map_err(|e| DatasetError::deserialize(path, e))?;
            array
                .iter()
                .map(|&v| -> Result<Vec<u32>> { Ok(to_index(v)?.into_iter().collect()) })
                .collect()
        }
        2 => {
            let array = array
                .into_dimensionality::<Ix2>()
                .map_err(|e| DatasetError::deserialize(path, e))?;
            array
                .rows()
                .into_iter()
                .map(|row| {
                    row.iter().filter_map(|&v| to_index(v).transpose()).collect::<Result<Vec<_>>>()
                })
                .collect()
        }
        n => Err(DatasetError::deserialize(
            path,
            format!("expected a 1-D or 2-D array, got {}-D", n),
        )),
    }
}

/// `np.save` 保存的 object 数组：`_reconstruct(ndarray, (0,), b'b')` 加上 BUILD 状态
struct PickledArray {
    shape: Vec<i64>,
    descr: String,
    data: Value,
}

fn pickled_array(value: &Value) -> Option<PickledArray> {
    let Value::Object(obj) = value else { return None };
    if !value.is_call_to("_reconstruct") {
        return None;
    }
    let obj = obj.borrow();
    let Some(Value::Tuple(state)) = &obj.state else { return None };
    // (version, shape, dtype, is_fortran, data)，早期版本没有 version
    let fields = match state.len() {
        5 => &state[1..],
        4 => &state[..],
        _ => return None,
    };
    let Value::Tuple(shape) = &fields[0] else { return None };
    let shape = shape
        .iter()
        .map(|d| match d {
            Value::Int(n) => Some(*n),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(PickledArray { shape, descr: dtype_descr(&fields[1])?, data: fields[3].clone() })
}

/// `dtype('i8', False, True)` 加上 BUILD 状态 `(3, '<', ...)`，拼成 `<i8`
fn dtype_descr(value: &Value) -> Option<String> {
    let Value::Object(obj) = value else { return None };
    if !value.is_call_to("dtype") {
        return None;
    }
    let obj = obj.borrow();
    let Value::Tuple(args) = &obj.args else { return None };
    let Some(Value::Str(kind)) = args.first() else { return None };
    let endian = match &obj.state {
        Some(Value::Tuple(state)) => match state.get(1) {
            Some(Value::Str(e)) if e != "=" => e.as_str(),
            _ => "<",
        },
        _ => "|",
    };
    Some(format!("{}{}", endian, kind))
}

/// 每个查询一个元素的不等长数组，元素可以是整数 ndarray、numpy 整数标量或 Python 列表
fn ragged_from_pickle(value: &Value) -> Result<Vec<Vec<u32>>, String> {
    let array = pickled_array(value).ok_or("expected a pickled numpy array")?;
    if array.shape.len() != 1 {
        return Err(format!("expected a 1-D object array, got shape {:?}", array.shape));
    }
    let Value::List(items) = &array.data else {
        return Err(format!("expected a list of objects, got {}", array.data.kind()));
    };

    items
        .iter()
        .enumerate()
        .map(|(query, item)| {
            let mut indices = vec![];
            collect_indices(item, &mut indices).map_err(|e| format!("query {}: {}", query, e))?;
            indices
                .into_iter()
                .map(|v| {
                    u32::try_from(v).map_err(|_| format!("query {}: invalid index {}", query, v))
                })
                .collect()
        })
        .collect()
}

fn collect_indices(value: &Value, out: &mut Vec<i64>) -> Result<(), String> {
    match value {
        Value::Int(v) => out.push(*v),
        Value::List(items) | Value::Tuple(items) => {
            for item in items {
                collect_indices(item, out)?;
            }
        }
        // numpy 整数标量：scalar(dtype, raw)
        Value::Object(obj) if value.is_call_to("scalar") => {
            let obj = obj.borrow();
            let Value::Tuple(args) = &obj.args else {
                return Err("malformed numpy scalar".to_owned());
            };
            let [dtype, Value::Bytes(raw)] = args.as_slice() else {
                return Err("malformed numpy scalar".to_owned());
            };
            let descr = dtype_descr(dtype).ok_or("numpy scalar without dtype")?;
            decode_ints(&descr, raw, out)?;
        }
        Value::Object(_) => {
            let array = pickled_array(value).ok_or("unsupported pickled object")?;
            match &array.data {
                Value::Bytes(raw) => decode_ints(&array.descr, raw, out)?,
                Value::List(items) => {
                    for item in items {
                        collect_indices(item, out)?;
                    }
                }
                other => return Err(format!("unexpected array data of type {}", other.kind())),
            }
        }
        other => return Err(format!("unexpected {} in ground truth", other.kind())),
    }
    Ok(())
}

fn decode_ints(descr: &str, raw: &[u8], out: &mut Vec<i64>) -> Result<(), String> {
    let ty: TypeStr = descr.parse().map_err(|e| format!("bad dtype '{}': {}", descr, e))?;
    let size = ty.num_bytes().unwrap_or(0);
    if !matches!(size, 1 | 2 | 4 | 8) || raw.len() % size != 0 {
        return Err(format!("unsupported dtype '{}' for {} bytes", descr, raw.len()));
    }
    for chunk in raw.chunks_exact(size) {
        let v = match ty.endianness() {
            Endianness::Big => read_int::<BigEndian>(ty.type_char(), chunk),
            _ => read_int::<LittleEndian>(ty.type_char(), chunk),
        };
        out.push(v.ok_or_else(|| format!("unsupported dtype '{}'", descr))?);
    }
    Ok(())
}

fn read_int<B: ByteOrder>(ty: TypeChar, chunk: &[u8]) -> Option<i64> {
    Some(match (ty, chunk.len()) {
        (TypeChar::Int, 1) => i64::from(chunk[0] as i8),
        (TypeChar::Uint, 1) => i64::from(chunk[0]),
        (TypeChar::Int, 2) => B::read_i16(chunk).into(),
        (TypeChar::Uint, 2) => B::read_u16(chunk).into(),
        (TypeChar::Int, 4) => B::read_i32(chunk).into(),
        (TypeChar::Uint, 4) => B::read_u32(chunk).into(),
        (TypeChar::Int, 8) => B::read_i64(chunk),
        (TypeChar::Uint, 8) => i64::try_from(B::read_u64(chunk)).unwrap_or(i64::MAX),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use ndarray::{Array1, array};
    use ndarray_npy::write_npy;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::pickle::Object;

    #[test]
    fn test_load_padded_npy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gt.npy");
        write_npy(&path, &array![[0i64, 1, -1], [2, -1, -1], [-1, -1, -1]]).unwrap();

        let gt = GroundTruth::load(&path).unwrap();
        assert_eq!(gt.len(), 3);
        assert_eq!(gt.matches(0), Some(&[0, 1][..]));
        assert_eq!(gt.matches(1), Some(&[2][..]));
        assert_eq!(gt.matches(2), Some(&[][..]));
        assert_eq!(gt.matches(3), None);
        assert_eq!(gt.total_matches(), 3);
    }

    #[test]
    fn test_load_1d_npy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gt.npy");
        write_npy(&path, &Array1::from(vec![3u32, 1, 4])).unwrap();

        let gt = GroundTruth::load(&path).unwrap();
        assert_eq!(gt, GroundTruth::new(vec![vec![3], vec![1], vec![4]]));
    }

    #[test]
    fn test_load_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gt.json");
        std::fs::write(&path, "[[0, 2], [], [1]]").unwrap();

        let gt = GroundTruth::load(&path).unwrap();
        assert_eq!(gt, GroundTruth::new(vec![vec![0, 2], vec![], vec![1]]));
    }

    #[test]
    fn test_reject_float_npy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gt.npy");
        write_npy(&path, &array![0.5f32, 1.5]).unwrap();

        let err = GroundTruth::load(&path).unwrap_err();
        assert!(matches!(err, DatasetError::Deserialize { .. }));
        assert!(err.to_string().contains("<f4"));
    }

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
    }

    #[rstest]
    #[case::int64_protocol3("ragged_gt_v3.npy")]
    #[case::int32_protocol4("ragged_gt_v4.npy")]
    #[case::python_lists("ragged_gt_lists.npy")]
    fn test_load_object_array(#[case] name: &str) {
        let gt = GroundTruth::load(fixture(name)).unwrap();
        assert_eq!(gt, GroundTruth::new(vec![vec![0, 1], vec![2]]));
    }

    #[test]
    fn test_reject_truncated_object_array() {
        let bytes = std::fs::read(fixture("ragged_gt_v3.npy")).unwrap();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gt.npy");
        std::fs::write(&path, &bytes[..bytes.len() - 20]).unwrap();

        let err = GroundTruth::load(&path).unwrap_err();
        assert!(matches!(err, DatasetError::Deserialize { .. }));
    }

    #[test]
    fn test_ragged_values() {
        // 列表中混有 numpy 标量和大端 uint16 数组
        let dtype = |kind: &str, endian: &str| {
            let obj = Object {
                callable: Value::Global { module: "numpy".into(), name: "dtype".into() },
                args: Value::Tuple(vec![Value::Str(kind.into()), Value::Int(0), Value::Int(1)]),
                state: Some(Value::Tuple(vec![Value::Int(3), Value::Str(endian.into())])),
            };
            Value::Object(Rc::new(RefCell::new(obj)))
        };
        let reconstruct = |shape: i64, dtype: Value, data: Value| {
            let obj = Object {
                callable: Value::Global {
                    module: "numpy.core.multiarray".into(),
                    name: "_reconstruct".into(),
                },
                args: Value::Tuple(vec![]),
                state: Some(Value::Tuple(vec![
                    Value::Int(1),
                    Value::Tuple(vec![Value::Int(shape)]),
                    dtype,
                    Value::Bool(false),
                    data,
                ])),
            };
            Value::Object(Rc::new(RefCell::new(obj)))
        };
        let scalar = Value::Object(Rc::new(RefCell::new(Object {
            callable: Value::Global {
                module: "numpy.core.multiarray".into(),
                name: "scalar".into(),
            },
            args: Value::Tuple(vec![dtype("i8", "<"), Value::Bytes(7i64.to_le_bytes().to_vec())]),
            state: None,
        })));

        let items = vec![
            Value::List(vec![Value::Int(1), scalar]),
            reconstruct(2, dtype("u2", ">"), Value::Bytes(vec![0, 3, 1, 0])),
            reconstruct(0, dtype("i8", "<"), Value::Bytes(vec![])),
        ];
        let outer = reconstruct(3, dtype("O8", "|"), Value::List(items));
        assert_eq!(ragged_from_pickle(&outer).unwrap(), vec![vec![1, 7], vec![3, 256], vec![]]);

        let negative = reconstruct(1, dtype("O8", "|"), Value::List(vec![Value::Int(-1)]));
        assert!(ragged_from_pickle(&negative).unwrap_err().contains("invalid index -1"));

        let floats = reconstruct(
            1,
            dtype("O8", "|"),
            Value::List(vec![reconstruct(1, dtype("f8", "<"), Value::Bytes(vec![0; 8]))]),
        );
        assert!(ragged_from_pickle(&floats).unwrap_err().contains("f8"));

        assert!(ragged_from_pickle(&Value::List(vec![])).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = GroundTruth::load("/nonexistent/gt.npy").unwrap_err();
        assert!(matches!(err, DatasetError::Deserialize { .. }));
    }

    #[test]
    fn test_validate() {
        let gt = GroundTruth::new(vec![vec![0, 1], vec![2]]);
        assert!(gt.validate(3, 2).is_ok());
        assert!(gt.validate(3, 3).is_err());
        assert!(gt.validate(2, 2).unwrap_err().contains("reference 2"));
    }
}
