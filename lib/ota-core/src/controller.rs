// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller-side update session.
//!
//! A pure state machine: the owner feeds it replies and time, it answers
//! with the next [`Action`] to perform on the bus. The owner is
//! responsible for actually reading chunk bytes (from an HTTP body, a file
//! on the SD card, or a test vector); the machine only deals in chunk
//! numbers and offsets.

pub const READY_TIMEOUT_US: u64 = 2_000_000;
pub const CHUNK_ACK_TIMEOUT_US: u64 = 500_000;
pub const VERIFY_TIMEOUT_US: u64 = 5_000_000;
pub const COMMIT_TIMEOUT_US: u64 = 30_000_000;
pub const CHUNK_RETRIES: u8 = 3;

/// What the owner should do next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    SendStart,
    SendChunk {
        chunk_num: u16,
        offset: u32,
        len: u16,
    },
    PollVerify,
    SendCommit,
    SendRestart,
}

/// Replies relevant to the session, already decoded by the owner.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ready { status: u16 },
    ChunkAck { chunk_num: u16 },
    VerifyResp { status: u16, crc32: u32 },
    CommitResp { status: u16 },
    Error { code: u16 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// Target never answered within the phase deadline.
    Timeout(Phase),
    /// Chunk retries exhausted.
    ChunkRetries { chunk_num: u16 },
    /// Target's staged image CRC disagreed with ours.
    VerifyMismatch { reported: u32 },
    /// Target reported a non-zero status or an UPDATE_ERROR.
    TargetError { code: u16 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingReady,
    SendingChunks,
    AwaitingVerify,
    AwaitingCommit,
    Done,
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    AwaitingReady {
        deadline: u64,
    },
    AwaitingChunkAck {
        chunk_num: u16,
        deadline: u64,
        retries: u8,
    },
    AwaitingVerify {
        deadline: u64,
    },
    AwaitingCommit {
        deadline: u64,
    },
    Done,
    Failed(FailReason),
}

pub struct ControllerSession {
    target: u8,
    size: u32,
    crc32: u32,
    chunk_size: u16,
    total_chunks: u16,
    chunks_acked: u16,
    state: State,
    last_activity_us: u64,
}

impl ControllerSession {
    /// Plans an update of `size` bytes in `chunk_size` pieces.
    pub fn new(target: u8, size: u32, crc32: u32, chunk_size: u16) -> Self {
        let total_chunks =
            size.div_ceil(u32::from(chunk_size)).min(crate::MAX_CHUNKS as u32)
                as u16;
        Self {
            target,
            size,
            crc32,
            chunk_size,
            total_chunks,
            chunks_acked: 0,
            state: State::Idle,
            last_activity_us: 0,
        }
    }

    pub fn target(&self) -> u8 {
        self.target
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn chunk_size(&self) -> u16 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u16 {
        self.total_chunks
    }

    pub fn chunks_acked(&self) -> u16 {
        self.chunks_acked
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Idle => Phase::Idle,
            State::AwaitingReady { .. } => Phase::AwaitingReady,
            State::AwaitingChunkAck { .. } => Phase::SendingChunks,
            State::AwaitingVerify { .. } => Phase::AwaitingVerify,
            State::AwaitingCommit { .. } => Phase::AwaitingCommit,
            State::Done => Phase::Done,
            State::Failed(_) => Phase::Failed,
        }
    }

    pub fn failure(&self) -> Option<FailReason> {
        match self.state {
            State::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    fn chunk_action(&self, chunk_num: u16) -> Action {
        let offset = u32::from(chunk_num) * u32::from(self.chunk_size);
        let len = (self.size - offset).min(u32::from(self.chunk_size)) as u16;
        Action::SendChunk {
            chunk_num,
            offset,
            len,
        }
    }

    /// Kicks the session off. The returned action is always `SendStart`.
    pub fn begin(&mut self, now_us: u64) -> Action {
        self.state = State::AwaitingReady {
            deadline: now_us + READY_TIMEOUT_US,
        };
        self.chunks_acked = 0;
        self.last_activity_us = now_us;
        Action::SendStart
    }

    /// Feeds a decoded reply from the target into the machine.
    pub fn on_reply(&mut self, reply: Reply, now_us: u64) -> Action {
        self.last_activity_us = now_us;
        match (self.state, reply) {
            (State::AwaitingReady { .. }, Reply::Ready { status: 0 }) => {
                self.state = State::AwaitingChunkAck {
                    chunk_num: 0,
                    deadline: now_us + CHUNK_ACK_TIMEOUT_US,
                    retries: 0,
                };
                self.chunk_action(0)
            }
            (State::AwaitingReady { .. }, Reply::Ready { status }) => {
                self.fail(FailReason::TargetError { code: status })
            }
            (
                State::AwaitingChunkAck { chunk_num, .. },
                Reply::ChunkAck { chunk_num: acked },
            ) if acked == chunk_num => {
                self.chunks_acked = chunk_num + 1;
                let next = chunk_num + 1;
                if next < self.total_chunks {
                    self.state = State::AwaitingChunkAck {
                        chunk_num: next,
                        deadline: now_us + CHUNK_ACK_TIMEOUT_US,
                        retries: 0,
                    };
                    self.chunk_action(next)
                } else {
                    self.state = State::AwaitingVerify {
                        deadline: now_us + VERIFY_TIMEOUT_US,
                    };
                    Action::PollVerify
                }
            }
            // A stale ack for an earlier chunk is noise, not progress.
            (State::AwaitingChunkAck { .. }, Reply::ChunkAck { .. }) => {
                Action::None
            }
            (
                State::AwaitingVerify { .. },
                Reply::VerifyResp { status, crc32 },
            ) => {
                if status != 0 || crc32 != self.crc32 {
                    self.fail(FailReason::VerifyMismatch { reported: crc32 })
                } else {
                    self.state = State::AwaitingCommit {
                        deadline: now_us + COMMIT_TIMEOUT_US,
                    };
                    Action::SendCommit
                }
            }
            (State::AwaitingCommit { .. }, Reply::CommitResp { status: 0 }) => {
                self.state = State::Done;
                Action::SendRestart
            }
            (State::AwaitingCommit { .. }, Reply::CommitResp { status }) => {
                self.fail(FailReason::TargetError { code: status })
            }
            (_, Reply::Error { code }) => {
                self.fail(FailReason::TargetError { code })
            }
            // Anything else is a reply arriving in the wrong phase.
            _ => Action::None,
        }
    }

    /// Deadline processing; call on every service-loop pass. Produces
    /// chunk retransmissions and phase failures.
    pub fn poll(&mut self, now_us: u64) -> Action {
        match self.state {
            State::AwaitingReady { deadline } if now_us >= deadline => {
                self.fail(FailReason::Timeout(Phase::AwaitingReady))
            }
            State::AwaitingChunkAck {
                chunk_num,
                deadline,
                retries,
            } if now_us >= deadline => {
                if retries >= CHUNK_RETRIES {
                    self.fail(FailReason::ChunkRetries { chunk_num })
                } else {
                    self.state = State::AwaitingChunkAck {
                        chunk_num,
                        deadline: now_us + CHUNK_ACK_TIMEOUT_US,
                        retries: retries + 1,
                    };
                    self.chunk_action(chunk_num)
                }
            }
            State::AwaitingVerify { deadline } if now_us >= deadline => {
                self.fail(FailReason::Timeout(Phase::AwaitingVerify))
            }
            State::AwaitingCommit { deadline } if now_us >= deadline => {
                self.fail(FailReason::Timeout(Phase::AwaitingCommit))
            }
            _ => Action::None,
        }
    }

    fn fail(&mut self, reason: FailReason) -> Action {
        self.state = State::Failed(reason);
        Action::None
    }
}
