use crate::grpc::ProtoHardState;
use crate::replica::ReplicaId;
use prost::Message;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::fmt;

#[derive(Copy, Clone, Default, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever the raft paper requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Store methods are CAS like. They return true if we have mutated state, and only return after
/// the new state is durable.
pub(crate) trait PersistentLocalState: Send + 'static {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> io::Result<bool>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

/// DurableLocalState keeps term and vote in a single small file. Every mutation rewrites the
/// whole file: write to a temp file, fsync, rename over the old one, fsync the directory.
pub(crate) struct DurableLocalState {
    path: PathBuf,
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
    // False when the state file did not exist at open.
    existed: bool,
}

impl DurableLocalState {
    pub(crate) fn open(path: impl AsRef<Path>, my_replica_id: ReplicaId) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (current_term, voted_for_this_term, existed) = match File::open(&path) {
            Ok(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                let hard_state = ProtoHardState::decode(buf.as_slice())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let voted_for = if hard_state.voted_for.is_empty() {
                    None
                } else {
                    Some(Arc::new(ReplicaId::new(hard_state.voted_for)))
                };
                (Term::new(hard_state.current_term), voted_for, true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => (Term::new(0), None, false),
            Err(e) => return Err(e),
        };

        Ok(DurableLocalState {
            path,
            current_term,
            voted_for_this_term,
            my_replica_id: Arc::new(my_replica_id),
            existed,
        })
    }

    /// True if no state has ever been persisted for this node.
    pub(crate) fn is_fresh(&self) -> bool {
        !self.existed && self.current_term == Term::new(0)
    }

    fn persist(&mut self, term: Term, voted_for: Option<Arc<ReplicaId>>) -> io::Result<()> {
        let hard_state = ProtoHardState {
            current_term: term.as_u64(),
            voted_for: voted_for.as_ref().map(|v| v.as_str().to_string()).unwrap_or_default(),
        };
        let mut buf = Vec::with_capacity(hard_state.encoded_len());
        hard_state
            .encode(&mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        write_atomically(&self.path, &buf)?;

        // Only update memory after disk.
        self.current_term = term;
        self.voted_for_this_term = voted_for;
        self.existed = true;
        Ok(())
    }
}

impl PersistentLocalState for DurableLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        if new_term <= self.current_term {
            return Ok(false);
        }

        self.persist(new_term, None)?;
        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.persist(expected_term, Some(Arc::new(vote)))?;
        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        let mut new_term = self.current_term;
        new_term.incr();
        self.persist(new_term, Some(self.my_replica_id.clone()))?;

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

/// Replaces the file at `path` with `contents` so that readers see either the old or the new
/// contents, never a mix.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_and_vote_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let me = ReplicaId::new("node-1");

        let mut state = DurableLocalState::open(&path, me.clone()).unwrap();
        assert!(state.is_fresh());
        assert_eq!(state.current_term(), Term::new(0));

        assert!(state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(2)).unwrap());
        assert!(state
            .store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("node-2"))
            .unwrap());
        // Already voted this term.
        assert!(!state
            .store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("node-3"))
            .unwrap());

        let state = DurableLocalState::open(&path, me.clone()).unwrap();
        assert!(!state.is_fresh());
        let (term, voted_for) = state.voted_for_current_term();
        assert_eq!(term, Term::new(3));
        assert_eq!(voted_for.as_deref(), Some(&ReplicaId::new("node-2")));
    }

    #[test]
    fn candidate_votes_for_self() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let me = ReplicaId::new("node-1");

        let mut state = DurableLocalState::open(&path, me.clone()).unwrap();
        let term = state.increment_term_and_vote_for_self().unwrap();
        assert_eq!(term, Term::new(1));

        let state = DurableLocalState::open(&path, me.clone()).unwrap();
        assert_eq!(state.voted_for_current_term(), (Term::new(1), Some(Arc::new(me))));
    }
}
