//! Transfer lifecycle states shared by the sender and receiver machines.

/// Sender path: Offering → Transferring → Completing → Done.
/// Receiver path: Waiting → Receiving → Verifying → Done.
/// Either side can end in Cancelled or Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Waiting,
    Offering,
    Transferring,
    Receiving,
    Completing,
    Verifying,
    Done,
    Cancelled,
    Error,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Done | TransferState::Cancelled | TransferState::Error
        )
    }
}
