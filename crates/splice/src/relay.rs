//! Cross-connection forwarding. A pair of circuit states on two
//! connections can be spliced together; sub-transactions created under one
//! circuit are mirrored onto the other and every subsequent message
//! reforwards automatically in both directions.

use tracing::{debug, warn};

use crate::{
    iocom::{IocomHandle, settle_relay_drops},
    msg::Msg,
    state::{RelayPeer, StateFlags},
    wire::CmdFlags,
};

/// Routes one received message to the paired connection. Runs on the IO
/// core thread of the receiving side with no locks held.
pub(crate) fn relay_msg(local: &IocomHandle, lmsg: &mut Msg) {
    let cmd = lmsg.hdr.cmd;

    let (rhandle, mut rmsg) = if (cmd & (CmdFlags::CREATE | CmdFlags::REPLY).bits()) ==
        CmdFlags::CREATE.bits()
    {
        // New sub-transaction: mirror it under the relay circuit and pair
        // the two states, one counted reference each way.
        let lstate = lmsg.state();
        let (rhandle, rcircuit) = {
            let core = local.shared.lock();
            let Some(st) = core.states.get(lstate) else { return };
            let Some(parent) = core.states.get(st.parent) else { return };
            match &parent.relay {
                Some(peer) => (peer.handle.clone(), peer.id),
                None => {
                    warn!("relay: circuit lost its pair");
                    return;
                }
            }
        };

        let Some(rmsg) = rhandle.msg_alloc(rcircuit, None, cmd) else {
            debug!("relay: remote circuit gone, dropping create");
            return;
        };
        let rstate = rmsg.state();
        {
            let mut rc = rhandle.shared.lock();
            rc.hold(rstate);
            if let Some(st) = rc.states.get_mut(rstate) {
                st.flags.insert(StateFlags::RELAY);
                st.relay = Some(RelayPeer { handle: local.clone(), id: lstate });
            }
        }
        {
            let mut lc = local.shared.lock();
            lc.hold(lstate);
            if let Some(st) = lc.states.get_mut(lstate) {
                st.relay = Some(RelayPeer { handle: rhandle.clone(), id: rstate });
            }
        }
        (rhandle, rmsg)
    } else {
        // State and pairing already established.
        let (rhandle, rstate) = {
            let core = local.shared.lock();
            let Some(st) = core.states.get(lmsg.state()) else { return };
            match &st.relay {
                Some(peer) => (peer.handle.clone(), peer.id),
                None => {
                    debug!("relay: message for an unpaired state, dropping");
                    return;
                }
            }
        };
        let Some(rmsg) = rhandle.msg_alloc(rstate, None, cmd) else {
            debug!("relay: paired state gone, dropping");
            return;
        };
        (rhandle, rmsg)
    };

    // Extended header travels verbatim; aux ownership moves to the
    // outgoing message.
    rmsg.ext = lmsg.ext.clone();
    rmsg.hdr.error = lmsg.hdr.error;
    rmsg.hdr.reserved02 = lmsg.hdr.reserved02;
    rmsg.hdr.reserved18 = lmsg.hdr.reserved18;
    rmsg.aux = lmsg.aux.take();

    rhandle.msg_write(rmsg);
    settle_relay_drops(&local.shared);
}
