//! Installer-style session events (server → client)
//!
//! Script and app-installer sessions reuse the low opcode range for their own
//! text frames: `0x01` log line, `0x02` step completed (`step[,detail…]`),
//! `0x03` step failed, `0x04` progress percent.

use crate::FrameError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerEvent {
    Log(String),
    StepCompleted { step: u32, details: Vec<String> },
    StepFailed(String),
    Progress(u8),
}

impl InstallerEvent {
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (&op, rest) = frame.split_first().ok_or(FrameError::Empty)?;
        let text = String::from_utf8_lossy(rest).into_owned();
        let bad = |reason: &str| FrameError::Payload {
            opcode: op,
            reason: reason.to_string(),
        };

        match op {
            0x01 => Ok(InstallerEvent::Log(text)),
            0x02 => {
                let mut parts = text.split(',');
                let step = parts
                    .next()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| bad("step number"))?;
                Ok(InstallerEvent::StepCompleted {
                    step,
                    details: parts.map(str::to_string).collect(),
                })
            }
            0x03 => Ok(InstallerEvent::StepFailed(text)),
            0x04 => {
                let percent: u8 = text.trim().parse().map_err(|_| bad("progress"))?;
                Ok(InstallerEvent::Progress(percent.min(100)))
            }
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_completed_carries_details() {
        assert_eq!(
            InstallerEvent::decode(b"\x021,Ubuntu,22.04").unwrap(),
            InstallerEvent::StepCompleted {
                step: 1,
                details: vec!["Ubuntu".into(), "22.04".into()],
            }
        );
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(
            InstallerEvent::decode(b"\x0442").unwrap(),
            InstallerEvent::Progress(42)
        );
        assert_eq!(
            InstallerEvent::decode(b"\x04250").unwrap(),
            InstallerEvent::Progress(100)
        );
        assert!(InstallerEvent::decode(b"\x04lots").is_err());
    }

    #[test]
    fn log_and_failure() {
        assert_eq!(
            InstallerEvent::decode(b"\x01apt-get update").unwrap(),
            InstallerEvent::Log("apt-get update".into())
        );
        assert_eq!(
            InstallerEvent::decode(b"\x03boom").unwrap(),
            InstallerEvent::StepFailed("boom".into())
        );
        assert_eq!(
            InstallerEvent::decode(b"\x07"),
            Err(FrameError::UnknownOpcode(0x07))
        );
    }
}
