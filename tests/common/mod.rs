#![allow(dead_code)]

use std::path::Path;

pub const ROW_LEN: usize = 3072;

fn short_binstring(p: &mut Vec<u8>, s: &[u8]) {
    p.push(b'U');
    p.push(s.len() as u8);
    p.extend_from_slice(s);
}

/// Pickles a batch the way the CIFAR-10 python archive does: a protocol 2
/// dict holding a label list and a `(rows, 3072)` uint8 ndarray.
pub fn pickle_batch(labels: &[u8], data: &[u8]) -> Vec<u8> {
    assert_eq!(labels.len() * ROW_LEN, data.len());
    let mut p = vec![0x80, 0x02, b'}', b'q', 0x01, b'('];

    short_binstring(&mut p, b"batch_label");
    short_binstring(&mut p, b"testing batch 1 of 1");

    short_binstring(&mut p, b"labels");
    p.extend_from_slice(b"]q\x02(");
    for &label in labels {
        p.push(b'K');
        p.push(label);
    }
    p.push(b'e');

    short_binstring(&mut p, b"data");
    p.extend_from_slice(b"cnumpy.core.multiarray\n_reconstruct\nq\x03cnumpy\nndarray\nq\x04");
    p.extend_from_slice(b"K\x00\x85U\x01b\x87R");
    p.extend_from_slice(b"(K\x01J");
    p.extend_from_slice(&(labels.len() as i32).to_le_bytes());
    p.extend_from_slice(b"M\x00\x0c\x86");
    p.extend_from_slice(b"cnumpy\ndtype\nU\x02u1K\x00K\x01\x87R");
    p.extend_from_slice(b"(K\x03U\x01|NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb");
    p.push(0x89);
    p.push(b'T');
    p.extend_from_slice(&(data.len() as i32).to_le_bytes());
    p.extend_from_slice(data);
    p.extend_from_slice(b"tb");

    p.push(b'u');
    p.push(b'.');
    p
}

/// Deterministic channel-major pixel data for `rows` images.
pub fn pixels(rows: usize) -> Vec<u8> {
    (0..rows * ROW_LEN)
        .map(|i| ((i / ROW_LEN) * 31 + i * 7) as u8)
        .collect()
}

pub fn write_batch(dir: &Path, name: &str, labels: &[u8]) {
    let bytes = pickle_batch(labels, &pixels(labels.len()));
    std::fs::write(dir.join(name), bytes).unwrap();
}

/// Writes all five train batches; `labels` go to the first one, the others
/// are empty.
pub fn write_train_batches(dir: &Path, labels: &[u8]) {
    write_batch(dir, "data_batch_1", labels);
    for i in 2..=5 {
        write_batch(dir, &format!("data_batch_{i}"), &[]);
    }
}

pub fn png_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().unwrap().is_file())
        .map(|entry| entry.file_name().into_string().unwrap())
        .filter(|name| name.ends_with(".png"))
        .collect();
    names.sort();
    names
}
