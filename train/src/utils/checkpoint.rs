use crate::common::*;
use regex::Regex;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

static CHECKPOINT_FILENAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}\+\d{4})_.+\.ckpt$")
        .expect("the pattern is valid")
});

/// Opaque learned-parameter blob; the store never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBlob(pub Vec<u8>);

/// What a checkpoint is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointKey {
    Iteration(usize),
    Tag(String),
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iteration(iteration) => write!(formatter, "{:06}", iteration),
            Self::Tag(tag) => write!(formatter, "{}", tag),
        }
    }
}

/// Save/load seam for learned parameters.
pub trait CheckpointStore {
    fn save(&mut self, key: &CheckpointKey, blob: &ParameterBlob) -> Result<()>;

    /// The blob of the most recently written checkpoint, if any.
    fn load_recent(&mut self) -> Result<Option<ParameterBlob>>;
}

/// Checkpoints as timestamped files in one directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new<P>(dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir '{}'", dir.display()))?;
        Ok(Self { dir })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, key: &CheckpointKey, blob: &ParameterBlob) -> Result<()> {
        let filename = format!("{}_{}.ckpt", Local::now().format(FILE_STRFTIME), key);
        let path = self.dir.join(filename);
        fs::write(&path, &blob.0)
            .with_context(|| format!("failed to write checkpoint '{}'", path.display()))?;
        info!("saved checkpoint {}", path.display());
        Ok(())
    }

    fn load_recent(&mut self) -> Result<Option<ParameterBlob>> {
        let paths: Vec<PathBuf> =
            glob::glob(&format!("{}/*.ckpt", self.dir.display()))?.try_collect()?;
        let recent = paths
            .into_iter()
            .filter_map(|path| {
                let file_name = path.file_name()?.to_str()?;
                let captures = CHECKPOINT_FILENAME_REGEX.captures(file_name)?;
                let datetime_str = captures.get(1)?.as_str();
                let datetime = DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
                Some((path, datetime))
            })
            .max_by_key(|(_path, datetime)| *datetime)
            .map(|(path, _datetime)| path);

        let path = match recent {
            Some(path) => path,
            None => {
                warn!("no checkpoint file found in {}", self.dir.display());
                return Ok(None);
            }
        };
        info!("load checkpoint file {}", path.display());
        let data = fs::read(&path)?;
        Ok(Some(ParameterBlob(data)))
    }
}
