//! Run directory layout and append-only CSV logs.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::StorageError;

/// `<root>/<YYYYmmdd_HHMMSS>/{log,model}`
#[derive(Debug, Clone)]
pub struct SaveDir {
    root: PathBuf,
}

impl SaveDir {
    /// Create a fresh timestamped run directory under `base`.
    pub fn create(base: &Path) -> Result<Self, StorageError> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut root = base.join(&stamp);
        // two runs started within the same second
        let mut n = 1;
        while root.exists() {
            root = base.join(format!("{stamp}_{n}"));
            n += 1;
        }
        Self::at(root)
    }

    /// Use `root` as the run directory, creating it if needed.
    pub fn at(root: PathBuf) -> Result<Self, StorageError> {
        let dir = SaveDir { root };
        for d in [dir.log_dir(), dir.model_dir()] {
            fs::create_dir_all(&d).map_err(|e| StorageError::io(&d, e))?;
        }
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }
}

/// A CSV file created with its header on the first append and appended
/// to afterwards. Each row is `key,v_0,v_1,...`.
pub struct CsvLog {
    path: PathBuf,
    header: Vec<String>,
    file: Option<File>,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>, header: Vec<String>) -> Self {
        CsvLog { path: path.into(), header, file: None }
    }

    /// Header `key_name, prefix_0 .. prefix_{n-1}`.
    pub fn indexed(path: impl Into<PathBuf>, key_name: &str, prefix: &str, n: usize) -> Self {
        let header = std::iter::once(key_name.to_string()).chain((0..n).map(|i| format!("{prefix}_{i}"))).collect();
        Self::new(path, header)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self) -> Result<&mut File, StorageError> {
        let file = match self.file.take() {
            Some(f) => f,
            None => {
                let mut f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .map_err(|e| StorageError::io(&self.path, e))?;
                let empty = f.metadata().map_err(|e| StorageError::io(&self.path, e))?.len() == 0;
                if empty {
                    writeln!(f, "{}", self.header.join(",")).map_err(|e| StorageError::io(&self.path, e))?;
                }
                f
            }
        };
        Ok(self.file.insert(file))
    }

    pub fn append(&mut self, key: usize, values: &[f64]) -> Result<(), StorageError> {
        let mut line = key.to_string();
        for v in values {
            line.push(',');
            line.push_str(&v.to_string());
        }
        let path = self.path.clone();
        let file = self.open()?;
        writeln!(file, "{line}").map_err(|e| StorageError::io(&path, e))
    }
}

/// The three per-episode training logs.
pub struct RunLogs {
    pub distance: CsvLog,
    pub reward: CsvLog,
    pub sigma: CsvLog,
}

impl RunLogs {
    pub fn new(log_dir: &Path) -> Self {
        let log = |name: &str, column: &str| {
            CsvLog::new(log_dir.join(name), vec!["episode".to_string(), column.to_string()])
        };
        RunLogs {
            distance: log("distance.csv", "distance"),
            reward: log("reward.csv", "reward"),
            sigma: log("sigma.csv", "mean_sigma"),
        }
    }

    pub fn record(&mut self, episode: usize, distance: f64, reward: f64, mean_sigma: f64) -> Result<(), StorageError> {
        self.distance.append(episode, &[distance])?;
        self.reward.append(episode, &[reward])?;
        self.sigma.append(episode, &[mean_sigma])
    }
}
