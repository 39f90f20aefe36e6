use crate::{parse_int, Tuple, Value};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Converts an int vector to a Tuple.
///
/// # Argument
///
/// * `data` - Data to put into tuple.
pub fn int_vec_to_tuple(data: Vec<i64>) -> Tuple {
    let values: Vec<Value> = data.into_iter().map(Value::Int).collect();
    Tuple::from_values(&values)
}

/// Reads back every column of an all-integer tuple.
pub fn tuple_to_ints(tuple: &Tuple) -> Vec<i64> {
    tuple.columns().map(|c| parse_int(c).unwrap_or(i64::MIN)).collect()
}

pub fn gen_rand_string(n: usize) -> String {
    thread_rng()
        .sample_iter(Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

pub fn gen_random_dir() -> PathBuf {
    init();
    let mut dir = env::temp_dir();
    dir.push(String::from("sharddb"));
    let rand_string = gen_rand_string(10);
    dir.push(rand_string);
    dir
}

/// Writes rows of integers as a flat partition file.
///
/// # Arguments
///
/// * `path` - File to create, parent directories included.
/// * `rows` - Records in storage order.
pub fn write_int_file<P: AsRef<Path>>(path: P, rows: &[Vec<i64>]) -> PathBuf {
    let lines: Vec<String> = rows
        .iter()
        .map(|r| {
            r.iter()
                .map(|v| v.to_string())
                .collect::<Vec<String>>()
                .join("|")
        })
        .collect();
    write_lines(path, &lines)
}

/// Writes pre-formatted lines as a flat partition file.
pub fn write_lines<P: AsRef<Path>>(path: P, lines: &[String]) -> PathBuf {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = fs::File::create(&path).unwrap();
    for line in lines {
        file.write_all(line.as_bytes()).unwrap();
        file.write_all(b"\n").unwrap();
    }
    path
}

/// True when both slices hold the same elements, in any order.
pub fn compare_unordered<T: PartialEq>(a: &[T], mut b: Vec<T>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    for x in a {
        match b.iter().position(|y| y == x) {
            None => return false,
            Some(idx) => {
                b.swap_remove(idx);
            }
        }
    }
    b.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn test_compare() {
        let mut rng = thread_rng();
        let a: Vec<Vec<i64>> = (0..100).map(|i| vec![i, i * 2]).collect();
        let mut b = a.clone();
        b.shuffle(&mut rng);
        assert!(compare_unordered(&a, b));
        let mut c = a.clone();
        c[rng.gen_range(0..a.len())] = vec![-1, -1];
        assert!(!compare_unordered(&a, c));
        assert!(!compare_unordered(&a, a[1..].to_vec()));
    }

    #[test]
    fn test_write_int_file() {
        let dir = gen_random_dir();
        let path = write_int_file(dir.join("t.0"), &[vec![1, 10], vec![2, 20]]);
        assert_eq!("1|10\n2|20\n", fs::read_to_string(&path).unwrap());
        assert_eq!(vec![3, 4], tuple_to_ints(&int_vec_to_tuple(vec![3, 4])));
        fs::remove_dir_all(dir).unwrap();
    }
}
