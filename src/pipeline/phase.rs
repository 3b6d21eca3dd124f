//! Request lifecycle phases.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestPhase {
    Idle,
    DownloadQueued,
    DownloadRunning,
    DownloadDone,
    DecodeQueued,
    DecodeRunning,
    Complete,
    DownloadFailed,
    DecodeFailed,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::DownloadFailed | Self::DecodeFailed
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::DownloadFailed | Self::DecodeFailed)
    }

    /// Legal forward edges. Failures only leave their running phase.
    pub fn can_transition_to(self, next: Self) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Idle, DownloadQueued)
                | (DownloadQueued, DownloadRunning)
                | (DownloadRunning, DownloadDone)
                | (DownloadRunning, DownloadFailed)
                | (DownloadDone, DecodeQueued)
                | (DecodeQueued, DecodeRunning)
                | (DecodeRunning, Complete)
                | (DecodeRunning, DecodeFailed)
        )
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::DownloadQueued => "download_queued",
            Self::DownloadRunning => "download_running",
            Self::DownloadDone => "download_done",
            Self::DecodeQueued => "decode_queued",
            Self::DecodeRunning => "decode_running",
            Self::Complete => "complete",
            Self::DownloadFailed => "download_failed",
            Self::DecodeFailed => "decode_failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use RequestPhase::*;

    const ALL: [RequestPhase; 9] = [
        Idle,
        DownloadQueued,
        DownloadRunning,
        DownloadDone,
        DecodeQueued,
        DecodeRunning,
        Complete,
        DownloadFailed,
        DecodeFailed,
    ];

    #[test]
    fn test_happy_path_is_a_chain() {
        let chain = [
            Idle,
            DownloadQueued,
            DownloadRunning,
            DownloadDone,
            DecodeQueued,
            DecodeRunning,
            Complete,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[rstest]
    #[case(DownloadRunning, DownloadFailed, true)]
    #[case(DecodeRunning, DecodeFailed, true)]
    #[case(DownloadQueued, DownloadFailed, false)]
    #[case(DecodeQueued, DecodeFailed, false)]
    #[case(DownloadRunning, DecodeFailed, false)]
    #[case(Idle, DecodeQueued, false)]
    fn test_failure_exits(
        #[case] from: RequestPhase,
        #[case] to: RequestPhase,
        #[case] legal: bool,
    ) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn test_terminal_phases_have_no_exits() {
        for from in ALL.iter().filter(|p| p.is_terminal()) {
            assert!(ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }
}
