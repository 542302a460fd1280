use std::{
    collections::BTreeSet,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use image::{Rgb, RgbImage};

use super::{
    errors::LoadError,
    pickle::{self, Value},
    split::DatasetSplit,
};

pub const IMAGE_SIDE: u32 = 32;
const PLANE: usize = 32 * 32;
/// Bytes per image: three 32x32 channel planes.
pub const ROW_LEN: usize = 3 * PLANE;

pub const TRAIN_FILES: [&str; 5] = [
    "data_batch_1",
    "data_batch_2",
    "data_batch_3",
    "data_batch_4",
    "data_batch_5",
];
pub const TEST_FILES: [&str; 1] = ["test_batch"];
/// Directory the official archive unpacks into.
pub const BATCH_DIR: &str = "cifar-10-batches-py";

#[cfg(feature = "download")]
const URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-python.tar.gz";
#[cfg(feature = "download")]
const MD5: &str = "c58f30108f718f92721af3b95e74349a";

pub fn batch_files(split: DatasetSplit) -> &'static [&'static str] {
    match split {
        DatasetSplit::Train => &TRAIN_FILES,
        DatasetSplit::Test => &TEST_FILES,
    }
}

/// Raw contents of one or more batch files: `labels.len()` images stored
/// back to back in `data`, each as `ROW_LEN` channel-major bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub data: Vec<u8>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn rows(&self) -> usize {
        self.data.len() / ROW_LEN
    }

    pub fn row(&self, index: usize) -> &[u8] {
        &self.data[index * ROW_LEN..(index + 1) * ROW_LEN]
    }

    pub fn append(&mut self, mut other: Batch) {
        self.data.append(&mut other.data);
        self.labels.append(&mut other.labels);
    }

    /// Extracts `data` and `labels` from an unpickled batch dictionary.
    pub fn from_value(path: &Path, value: &Value) -> Result<Self, LoadError> {
        let field = |key: &'static str| {
            value.get(key).ok_or_else(|| LoadError::MissingKey {
                path: path.to_path_buf(),
                key,
            })
        };
        let unexpected = |key: &'static str, found: String| LoadError::UnexpectedType {
            path: path.to_path_buf(),
            key,
            found,
        };

        let data = match field("data")? {
            Value::Array(array) => {
                let bytes = array.as_u8().ok_or_else(|| {
                    let descr = array.dtype.as_ref().map(|d| d.descr.as_str());
                    unexpected("data", format!("ndarray of {}", descr.unwrap_or("?")))
                })?;
                let [rows, ROW_LEN] = array.shape[..] else {
                    return Err(LoadError::BadShape {
                        path: path.to_path_buf(),
                        row_len: ROW_LEN,
                        shape: array.shape.clone(),
                    });
                };
                if array.fortran_order {
                    transpose(bytes, ROW_LEN, rows)
                } else {
                    bytes.to_vec()
                }
            }
            other => return Err(unexpected("data", other.type_name().to_owned())),
        };

        let raw_labels = match field("labels")? {
            Value::List(items) | Value::Tuple(items) => items
                .iter()
                .map(|item| match item {
                    Value::Int(n) => Ok(*n),
                    other => Err(unexpected("labels", format!("list of {}", other.type_name()))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Value::Array(array) => array
                .to_i64_vec()
                .ok_or_else(|| unexpected("labels", "non-integer ndarray".to_owned()))?,
            other => return Err(unexpected("labels", other.type_name().to_owned())),
        };
        let labels = raw_labels
            .into_iter()
            .map(|label| match u8::try_from(label) {
                Ok(lbl) => Ok(usize::from(lbl)),
                Err(_) => Err(LoadError::InvalidLabel {
                    path: path.to_path_buf(),
                    label,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let batch = Self { data, labels };
        if batch.labels.len() != batch.rows() {
            return Err(LoadError::LabelCountMismatch {
                path: path.to_path_buf(),
                labels: batch.labels.len(),
                rows: batch.rows(),
            });
        }
        Ok(batch)
    }
}

/// Column-major `rows x cols` to row-major.
fn transpose(bytes: &[u8], cols: usize, rows: usize) -> Vec<u8> {
    let mut out = vec![0u8; bytes.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[r * cols + c] = bytes[c * rows + r];
        }
    }
    out
}

pub fn load_batch<P: AsRef<Path>>(path: P) -> Result<Batch, LoadError> {
    let path = path.as_ref();
    let f = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = pickle::from_reader(BufReader::new(f)).map_err(|source| LoadError::Pickle {
        path: path.to_path_buf(),
        source,
    })?;
    Batch::from_value(path, &value)
}

/// Permutes one channel-major row `(3, 32, 32)` into a pixel-major image
/// `(32, 32, 3)`.
pub fn to_image(row: &[u8]) -> RgbImage {
    assert_eq!(row.len(), ROW_LEN);
    RgbImage::from_fn(IMAGE_SIDE, IMAGE_SIDE, |x, y| {
        let x = x as usize;
        let y = y as usize;
        Rgb([
            row[y * 32 + x],
            row[PLANE + y * 32 + x],
            row[2 * PLANE + y * 32 + x],
        ])
    })
}

/// Inverse of [`to_image`].
pub fn to_planar(img: &RgbImage) -> Vec<u8> {
    let mut row = vec![0u8; ROW_LEN];
    for (x, y, Rgb([r, g, b])) in img.enumerate_pixels() {
        let i = y as usize * 32 + x as usize;
        row[i] = *r;
        row[PLANE + i] = *g;
        row[2 * PLANE + i] = *b;
    }
    row
}

/// Picks the directory holding `files`: `root` itself, or the directory the
/// official archive unpacks into below it.
pub fn resolve_root<P: AsRef<Path>>(root: P, files: &[&str]) -> PathBuf {
    let root = root.as_ref();
    let has_all = |dir: &Path| files.iter().all(|f| dir.join(f).exists());
    let nested = root.join(BATCH_DIR);
    if !has_all(root) && has_all(&nested) {
        nested
    } else {
        root.to_path_buf()
    }
}

/// The decoded images of one split, in batch order.
pub struct Cifar10 {
    data: Vec<(RgbImage, usize)>,
    pub split: DatasetSplit,
}

impl std::ops::Index<usize> for Cifar10 {
    type Output = (RgbImage, usize);
    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

impl Cifar10 {
    pub fn new<P: AsRef<Path>>(root: P, split: DatasetSplit) -> Result<Self, LoadError> {
        let files = batch_files(split);
        let root = resolve_root(root, files);
        let mut batch = Batch::default();
        for &f in files {
            let next = load_batch(root.join(f))?;
            tracing::debug!("Loaded {} images from {}", next.rows(), f);
            batch.append(next);
        }
        Ok(Self::from_batch(batch, split))
    }

    pub fn from_batch(batch: Batch, split: DatasetSplit) -> Self {
        let data = batch
            .labels
            .iter()
            .enumerate()
            .map(|(i, &lbl)| (to_image(batch.row(i)), lbl))
            .collect();
        Self { data, split }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(RgbImage, usize)> {
        self.data.iter()
    }

    /// Number of distinct labels present.
    pub fn num_classes(&self) -> usize {
        self.data
            .iter()
            .map(|(_, lbl)| *lbl)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn label_name(lbl: usize) -> Option<&'static str> {
        LABEL_NAMES.get(lbl).copied()
    }
}

/// Makes sure the batch files of `split` are available under `root`,
/// downloading and unpacking the official archive when they are not.
#[cfg(feature = "download")]
pub fn fetch<P: AsRef<Path>>(root: P, split: DatasetSplit) -> Result<PathBuf, LoadError> {
    use super::download::{download_to, unpack_to};

    let root = root.as_ref();
    let files = batch_files(split);
    let resolved = resolve_root(root, files);
    if files.iter().all(|f| resolved.join(f).exists()) {
        return Ok(resolved);
    }
    let archive = download_to(root, URL, MD5)?;
    unpack_to(root, &archive)?;
    Ok(root.join(BATCH_DIR))
}

pub const LABEL_NAMES: [&str; 10] = [
    "Airplane",
    "Automobile",
    "Bird",
    "Cat",
    "Deer",
    "Dog",
    "Frog",
    "Horse",
    "Ship",
    "Truck",
];
