use crate::grpc::ProtoSnapshotMeta;
use crate::replica::cluster::ClusterConfig;
use crate::replica::local_state::{write_atomically, Term};
use crate::replica::Index;
use prost::Message;
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const META_FILE_NAME: &str = "snapshot.meta";
const DATA_EXTENSION: &str = "snap";
const INCOMING_DIR_NAME: &str = "incoming";

/// SnapshotMeta describes what a snapshot covers: everything up to and including
/// `last_included_index`, plus the configuration committed at that point.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SnapshotMeta {
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    pub(crate) config: ClusterConfig,
}

impl From<&SnapshotMeta> for ProtoSnapshotMeta {
    fn from(meta: &SnapshotMeta) -> Self {
        ProtoSnapshotMeta {
            last_included_index: meta.last_included_index.as_u64(),
            last_included_term: meta.last_included_term.as_u64(),
            config: Some((&meta.config).into()),
        }
    }
}

impl TryFrom<ProtoSnapshotMeta> for SnapshotMeta {
    type Error = &'static str;

    fn try_from(proto: ProtoSnapshotMeta) -> Result<Self, Self::Error> {
        let last_included_index = Index::new(proto.last_included_index).ok_or("Snapshot last included index is 0")?;
        let config = proto.config.ok_or("Snapshot is missing its cluster configuration")?;

        Ok(SnapshotMeta {
            last_included_index,
            last_included_term: Term::new(proto.last_included_term),
            config: config.into(),
        })
    }
}

/// SnapshotStore keeps the latest state machine snapshot on disk.
///
/// Layout: `snapshot.meta` (prost `ProtoSnapshotMeta`, replaced atomically) names the current
/// `<index>.snap` data file. Data is always fully written and synced under `incoming/` before it is
/// renamed into place, and the meta file is only switched after that, so a crash at any point leaves
/// the previous snapshot intact.
#[derive(Clone, Debug)]
pub(crate) struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub(crate) fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let incoming = dir.join(INCOMING_DIR_NAME);
        fs::create_dir_all(&incoming)?;

        // Leftovers from transfers interrupted by a crash.
        for entry in fs::read_dir(&incoming)? {
            fs::remove_file(entry?.path())?;
        }

        Ok(SnapshotStore { dir })
    }

    pub(crate) fn latest(&self) -> io::Result<Option<SnapshotMeta>> {
        let bytes = match fs::read(self.dir.join(META_FILE_NAME)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let proto = ProtoSnapshotMeta::decode(bytes.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let meta = SnapshotMeta::try_from(proto).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(meta))
    }

    pub(crate) fn data_path(&self, last_included_index: Index) -> PathBuf {
        self.dir
            .join(format!("{:020}", last_included_index.as_u64()))
            .with_extension(DATA_EXTENSION)
    }

    pub(crate) fn open_data(&self, meta: &SnapshotMeta) -> io::Result<File> {
        File::open(self.data_path(meta.last_included_index))
    }

    /// A fresh path to stream incoming snapshot data into.
    pub(crate) fn incoming_path(&self) -> PathBuf {
        let name = format!("{:016x}.partial", rand::random::<u64>());
        self.dir.join(INCOMING_DIR_NAME).join(name)
    }

    /// Writes a new snapshot from `data` and makes it the latest.
    pub(crate) fn create(&self, meta: &SnapshotMeta, data: &mut dyn Read) -> io::Result<()> {
        let incoming = self.incoming_path();
        {
            let mut file = File::create(&incoming)?;
            io::copy(data, &mut file)?;
            file.sync_all()?;
        }

        self.install(meta, &incoming)
    }

    /// Makes the fully written file at `incoming` the latest snapshot and removes older ones.
    pub(crate) fn install(&self, meta: &SnapshotMeta, incoming: &Path) -> io::Result<()> {
        let data_path = self.data_path(meta.last_included_index);
        fs::rename(incoming, &data_path)?;
        File::open(&self.dir)?.sync_all()?;

        let proto = ProtoSnapshotMeta::from(meta);
        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto.encode(&mut buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        write_atomically(&self.dir.join(META_FILE_NAME), &buf)?;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_data = path.extension().map(|ext| ext == DATA_EXTENSION).unwrap_or(false);
            if is_data && path != data_path {
                fs::remove_file(path)?;
            }
        }

        Ok(())
    }
}
