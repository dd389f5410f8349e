use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU16;

use davey::{DaveSession, ProposalsOperationType};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Frame Discord treats as silence. Never end-to-end encrypted.
pub(super) const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Proposals held while the external sender is unknown.
const PROPOSAL_BACKLOG_LIMIT: usize = 64;

/// Handshake messages that move the group to a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Handshake {
    Commit,
    Welcome,
}

struct Group {
    session: DaveSession,
    /// `Some` until the external sender arrives; proposals wait here.
    backlog: Option<Vec<Vec<u8>>>,
}

/// End-to-end encryption state for one voice connection.
///
/// The bot only ever sends audio, so the group exists to produce our key
/// package and commits and to encrypt outgoing Opus frames.
pub(super) struct DaveHandler {
    user_id: u64,
    channel_id: u64,
    group: Option<Group>,
    version: u16,
    /// transition id -> protocol version it switches to
    transitions: HashMap<u16, u16>,
    encrypting: bool,
}

impl DaveHandler {
    pub(super) fn new(user_id: u64, channel_id: u64) -> Self {
        DaveHandler {
            user_id,
            channel_id,
            group: None,
            version: 0,
            transitions: HashMap::new(),
            encrypting: false,
        }
    }

    pub(super) fn version(&self) -> u16 {
        self.version
    }

    /// Joins (or rejoins) the group at `version` and returns our key package.
    pub(super) fn start(&mut self, version: u16) -> Result<Vec<u8>> {
        let group_version = NonZeroU16::new(version).unwrap_or(NonZeroU16::MIN);
        let session = match self.group.take() {
            Some(Group { mut session, .. }) => {
                session
                    .reinit(group_version, self.user_id, self.channel_id, None)
                    .map_err(dave_err)?;
                session
            }
            None => DaveSession::new(group_version, self.user_id, self.channel_id, None)
                .map_err(dave_err)?,
        };

        let group = self.group.insert(Group {
            session,
            backlog: Some(Vec::new()),
        });
        self.version = version;
        self.encrypting = false;

        let key_package = group.session.create_key_package().map_err(dave_err)?;
        debug!(version, bytes = key_package.len(), "DAVE key package ready");
        Ok(key_package)
    }

    /// Throws the group away after a failed handshake and starts over.
    pub(super) fn restart(&mut self, version: u16) -> Result<Vec<u8>> {
        self.group = None;
        self.transitions.clear();
        info!(version, "DAVE group restarted");
        self.start(version)
    }

    /// Returns `true` if the server expects a transition-ready reply.
    pub(super) fn prepare_transition(&mut self, transition_id: u16, version: u16) -> bool {
        if transition_id == 0 {
            self.switch_version(version);
            return false;
        }
        self.transitions.insert(transition_id, version);
        true
    }

    pub(super) fn execute_transition(&mut self, transition_id: u16) {
        match self.transitions.remove(&transition_id) {
            Some(version) => self.switch_version(version),
            None => debug!(transition_id, "unknown DAVE transition"),
        }
    }

    fn switch_version(&mut self, version: u16) {
        if version != self.version {
            info!(from = self.version, to = version, "DAVE protocol version changed");
        }
        self.version = version;
    }

    /// Epoch 1 starts a fresh group, which needs a fresh key package.
    pub(super) fn prepare_epoch(&mut self, epoch: u64, version: u16) -> Option<Vec<u8>> {
        if epoch != 1 {
            return None;
        }
        self.start(version)
            .inspect_err(|e| warn!("DAVE epoch {epoch} could not start a group: {e}"))
            .ok()
    }

    /// Sets the external sender and replays any proposals that were waiting
    /// for it. Returns the commits to send.
    pub(super) fn set_external_sender(&mut self, data: &[u8], members: &HashSet<u64>) -> Result<Vec<Vec<u8>>> {
        let Some(group) = &mut self.group else {
            return Ok(Vec::new());
        };
        group.session.set_external_sender(data).map_err(dave_err)?;

        let backlog = group.backlog.take().unwrap_or_default();
        let mut commits = Vec::new();
        for proposals in &backlog {
            match commit_proposals(&mut group.session, proposals, members) {
                Ok(Some(commit)) => commits.push(commit),
                Ok(None) => {}
                Err(e) => warn!("dropping buffered DAVE proposals: {e}"),
            }
        }
        Ok(commits)
    }

    /// Returns a commit to send, if the proposals produced one.
    pub(super) fn proposals(&mut self, data: &[u8], members: &HashSet<u64>) -> Result<Option<Vec<u8>>> {
        if data.is_empty() {
            return Err(Error::Dave("empty proposals payload".into()));
        }
        let Some(group) = &mut self.group else {
            return Ok(None);
        };

        match &mut group.backlog {
            Some(backlog) if backlog.len() < PROPOSAL_BACKLOG_LIMIT => {
                backlog.push(data.to_vec());
                Ok(None)
            }
            Some(_) => {
                warn!("DAVE proposal backlog full, dropping proposals");
                Ok(None)
            }
            None => commit_proposals(&mut group.session, data, members),
        }
    }

    /// Applies a commit or welcome and returns the transition id it carries.
    pub(super) fn handshake(&mut self, kind: Handshake, data: &[u8]) -> Result<u16> {
        let [hi, lo, message @ ..] = data else {
            return Err(Error::Dave(format!("{kind:?} payload too short")));
        };
        let transition_id = u16::from_be_bytes([*hi, *lo]);

        if let Some(group) = &mut self.group {
            match kind {
                Handshake::Commit => group.session.process_commit(message).map(drop).map_err(dave_err),
                Handshake::Welcome => group.session.process_welcome(message).map(drop).map_err(dave_err),
            }?;
            if transition_id != 0 {
                self.transitions.insert(transition_id, self.version);
            }
        }
        Ok(transition_id)
    }

    /// Encrypts an outgoing Opus frame once the group is ready. Silence and
    /// frames sent before then go out as they are.
    pub(super) fn encrypt<'a>(&mut self, frame: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if self.version == 0 || frame == SILENCE_FRAME {
            return Ok(Cow::Borrowed(frame));
        }
        let Some(group) = &mut self.group else {
            return Ok(Cow::Borrowed(frame));
        };

        let ready = group.session.is_ready();
        if ready != self.encrypting {
            self.encrypting = ready;
            if ready {
                info!(version = self.version, "DAVE ready, encrypting audio");
            } else {
                warn!(version = self.version, "DAVE group not ready, audio is unencrypted");
            }
        }
        if !ready {
            return Ok(Cow::Borrowed(frame));
        }

        group
            .session
            .encrypt_opus(frame)
            .map(|encrypted| Cow::Owned(encrypted.into_owned()))
            .map_err(dave_err)
    }
}

fn commit_proposals(session: &mut DaveSession, data: &[u8], members: &HashSet<u64>) -> Result<Option<Vec<u8>>> {
    let (operation, proposals) = match data.split_first() {
        Some((0, rest)) => (ProposalsOperationType::APPEND, rest),
        Some((1, rest)) => (ProposalsOperationType::REVOKE, rest),
        Some((other, _)) => return Err(Error::Dave(format!("unknown proposals operation {other}"))),
        None => return Err(Error::Dave("empty proposals payload".into())),
    };

    let members: Vec<u64> = members.iter().copied().collect();
    let outcome = session
        .process_proposals(operation, proposals, Some(&members))
        .map_err(dave_err)?;

    Ok(outcome.map(|commit_welcome| {
        let mut commit = commit_welcome.commit;
        commit.extend(commit_welcome.welcome.unwrap_or_default());
        commit
    }))
}

fn dave_err(e: impl std::fmt::Display) -> Error {
    Error::Dave(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_is_plain_until_a_version_is_negotiated() {
        let mut dave = DaveHandler::new(1, 2);
        assert!(matches!(dave.encrypt(b"opus").unwrap(), Cow::Borrowed(b"opus")));
        assert!(matches!(dave.encrypt(&SILENCE_FRAME).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn transition_zero_applies_at_once() {
        let mut dave = DaveHandler::new(1, 2);
        assert!(!dave.prepare_transition(0, 1));
        assert_eq!(dave.version(), 1);

        assert!(dave.prepare_transition(5, 0));
        assert_eq!(dave.version(), 1);
        dave.execute_transition(7);
        assert_eq!(dave.version(), 1);
        dave.execute_transition(5);
        assert_eq!(dave.version(), 0);
    }

    #[test]
    fn proposals_without_a_group_are_ignored() {
        let mut dave = DaveHandler::new(1, 2);
        let members = HashSet::from([1u64]);
        assert_eq!(dave.proposals(&[0, 1, 2], &members).unwrap(), None);
        assert!(dave.proposals(&[], &members).is_err());
    }

    #[test]
    fn proposals_wait_for_the_external_sender() {
        let mut dave = DaveHandler::new(1, 2);
        let key_package = dave.start(1).unwrap();
        assert!(!key_package.is_empty());

        let members = HashSet::from([1u64]);
        assert_eq!(dave.proposals(&[0, 1, 2], &members).unwrap(), None);
        let backlog = dave.group.as_ref().and_then(|g| g.backlog.as_ref()).unwrap();
        assert_eq!(backlog.len(), 1);

        // Not ready yet, so audio is still sent in the clear.
        assert!(matches!(dave.encrypt(b"opus").unwrap(), Cow::Borrowed(b"opus")));
    }

    #[test]
    fn handshake_reads_the_transition_id() {
        let mut dave = DaveHandler::new(1, 2);
        assert!(dave.handshake(Handshake::Commit, &[1]).is_err());
        assert_eq!(dave.handshake(Handshake::Welcome, &[0, 9]).unwrap(), 9);
    }
}
