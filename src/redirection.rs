//! The descriptor rearrangement a child performs before exec.

use std::os::fd::RawFd;

/// A type that represents the action dup2(src, target).
/// If target is negative, this represents close(src).
/// Note none of the fds here are considered 'owned'.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Dup2Action {
    pub src: RawFd,
    pub target: RawFd,
}

/// A sequence of basic redirections, applied in order.
#[derive(Clone, Debug, Default)]
pub struct Dup2List {
    /// The list of actions.
    pub actions: Vec<Dup2Action>,
}

impl Dup2List {
    pub fn new() -> Self {
        Default::default()
    }

    /// Build the list for a child's standard streams. Each `Some` entry is dup2'd onto slot
    /// 0, 1 or 2 respectively; `None` leaves the slot inherited.
    pub fn for_std_streams(streams: [Option<RawFd>; 3]) -> Self {
        let mut result = Self::new();
        for (target, src) in streams.into_iter().enumerate() {
            if let Some(src) = src {
                result.add_dup2(src, target as RawFd);
            }
        }
        result
    }

    /// Return the list of dup2 actions.
    pub fn get_actions(&self) -> &[Dup2Action] {
        &self.actions
    }

    /// Return the fd ultimately dup'd to a target fd, or -1 if the target is closed.
    /// For example, if target fd is 1, and we have a dup2 chain 5->3 and 3->1, then we will
    /// return 5. If the target is not referenced in the chain, returns target.
    pub fn fd_for_target_fd(&self, target: RawFd) -> RawFd {
        if target < 0 {
            return target;
        }
        // Note we can simply walk our action list backwards, looking for src -> target dups.
        let mut cursor = target;
        for action in self.actions.iter().rev() {
            if action.target == cursor {
                // cursor is replaced by action.src
                cursor = action.src;
            } else if action.src == cursor && action.target < 0 {
                // cursor is closed.
                cursor = -1;
                break;
            }
        }
        cursor
    }

    /// Append a dup2 action.
    pub fn add_dup2(&mut self, src: RawFd, target: RawFd) {
        assert!(src >= 0 && target >= 0, "Invalid fd in add_dup2");
        // Note: record these even if src and target is the same.
        // This is a note that we must clear the CLO_EXEC bit.
        self.actions.push(Dup2Action { src, target });
    }

    /// Append a close action.
    pub fn add_close(&mut self, fd: RawFd) {
        assert!(fd >= 0, "Invalid fd in add_close");
        self.actions.push(Dup2Action {
            src: fd,
            target: -1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Dup2Action, Dup2List};

    #[test]
    fn test_std_streams() {
        let list = Dup2List::for_std_streams([Some(12), None, Some(15)]);
        assert_eq!(
            list.get_actions(),
            &[
                Dup2Action { src: 12, target: 0 },
                Dup2Action { src: 15, target: 2 }
            ]
        );
        assert_eq!(list.fd_for_target_fd(0), 12);
        assert_eq!(list.fd_for_target_fd(1), 1);
        assert_eq!(list.fd_for_target_fd(2), 15);
    }

    #[test]
    fn test_dup2_chain_and_close() {
        let mut list = Dup2List::new();
        list.add_dup2(5, 3);
        list.add_dup2(3, 1);
        assert_eq!(list.fd_for_target_fd(1), 5);
        list.add_close(5);
        assert_eq!(list.fd_for_target_fd(5), -1);
        assert_eq!(list.fd_for_target_fd(-1), -1);
    }
}
