use crate::{
    state::StateId,
    wire::{CmdFlags, Header},
};

/// One protocol message: a core header, optional extended-header bytes and
/// an optional aux payload. A message holds exactly one reference on its
/// transaction state from allocation until it is retired by the connection
/// that owns it.
pub struct Msg {
    pub hdr: Header,
    /// Extended header beyond the core 64 bytes. Opaque to the core and
    /// never byte-swapped.
    pub ext: Vec<u8>,
    pub aux: Option<Vec<u8>>,
    /// Switchable command for user dispatch, filled in on reception.
    pub tcmd: u32,
    pub(crate) state: StateId,
    /// Receive-side state bookkeeping already ran (synthesized failures
    /// and the final link-error sentinel are queued pre-processed).
    pub(crate) stated: bool,
    /// Encoded header staged by the transmit flush.
    pub(crate) wire: Vec<u8>,
}

impl Msg {
    pub(crate) fn new(state: StateId, hdr: Header, ext: Vec<u8>, aux: Option<Vec<u8>>) -> Self {
        Self { hdr, ext, aux, tcmd: 0, state, stated: false, wire: Vec::new() }
    }

    /// The transaction this message belongs to.
    #[inline]
    pub fn state(&self) -> StateId {
        self.state
    }

    #[inline]
    pub fn cmd(&self) -> u32 {
        self.hdr.cmd
    }

    #[inline]
    pub fn has(&self, flags: CmdFlags) -> bool {
        self.hdr.has(flags)
    }

    /// Takes the aux payload out of the message.
    #[inline]
    pub fn take_aux(&mut self) -> Option<Vec<u8>> {
        self.aux.take()
    }
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msg")
            .field("cmd", &format_args!("{:08x}", self.hdr.cmd))
            .field("msgid", &self.hdr.msgid)
            .field("circuit", &self.hdr.circuit)
            .field("error", &self.hdr.error)
            .field("aux", &self.aux.as_ref().map(Vec::len))
            .finish()
    }
}
