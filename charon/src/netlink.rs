//! Minimal blocking netlink request/response plumbing.
//!
//! The ethtool, RDMA and TC cleanup clients all follow the same shape: one
//! short-lived socket, one request, a bounded read loop. They run on
//! blocking threads (often pinned inside a pod namespace), so the plain
//! synchronous `netlink-sys` socket is the right tool; the long-lived
//! link/address/route work goes through `rtnetlink` instead.

use std::fmt::Debug;

use anyhow::{Context, Result, bail};
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST, NetlinkDeserializable, NetlinkHeader, NetlinkMessage,
    NetlinkPayload, NetlinkSerializable,
};
use netlink_sys::{Socket, SocketAddr};

const RECV_BUF_LEN: usize = 64 * 1024;

/// Send one request and collect every inner response message.
///
/// `dump` requests set NLM_F_DUMP and read until Done; plain requests set
/// NLM_F_ACK and read until the ack arrives. A netlink error reply is
/// surfaced as an `std::io::Error` wrapped in the result, so callers can
/// inspect the errno (EEXIST, EOPNOTSUPP, EINTR).
pub fn request<T>(protocol: isize, payload: T, dump: bool) -> Result<Vec<T>>
where
    T: NetlinkSerializable + NetlinkDeserializable + Clone + Debug,
{
    let socket = Socket::new(protocol).context("failed to open netlink socket")?;
    socket
        .connect(&SocketAddr::new(0, 0))
        .context("failed to connect netlink socket")?;

    let mut message =
        NetlinkMessage::new(NetlinkHeader::default(), NetlinkPayload::InnerMessage(payload));
    message.header.flags = if dump {
        NLM_F_REQUEST | NLM_F_DUMP
    } else {
        NLM_F_REQUEST | NLM_F_ACK
    };
    message.header.sequence_number = 1;
    message.finalize();

    let mut buf = vec![0u8; message.buffer_len()];
    message.serialize(&mut buf);
    socket.send(&buf, 0).context("netlink send failed")?;

    let mut responses = Vec::new();
    let mut recv_buf = vec![0u8; RECV_BUF_LEN];

    loop {
        let len = socket
            .recv(&mut &mut recv_buf[..], 0)
            .context("netlink recv failed")?;
        if len == 0 {
            bail!("netlink socket closed before reply");
        }

        let mut offset = 0;
        while offset < len {
            let reply = NetlinkMessage::<T>::deserialize(&recv_buf[offset..len])
                .context("failed to parse netlink reply")?;
            let reply_len = reply.header.length as usize;
            match reply.payload {
                NetlinkPayload::InnerMessage(inner) => responses.push(inner),
                NetlinkPayload::Error(err) => {
                    if let Some(code) = err.code {
                        return Err(anyhow::Error::new(std::io::Error::from_raw_os_error(
                            -code.get(),
                        ))
                        .context("netlink request rejected"));
                    }
                    // code 0 is the ack
                    return Ok(responses);
                }
                NetlinkPayload::Done(_) => return Ok(responses),
                NetlinkPayload::Noop => {}
                other => bail!("unexpected netlink payload {:?}", other),
            }
            if reply_len == 0 {
                break;
            }
            offset += reply_len;
        }
        // keep reading until the ack (plain request) or Done (dump) returns
    }
}

/// Extract the errno from a netlink error produced by [`request`], if any.
pub fn errno(err: &anyhow::Error) -> Option<i32> {
    err.downcast_ref::<std::io::Error>().and_then(|io| io.raw_os_error())
}

/// True when the error is the netlink "already exists" reply.
pub fn is_exist(err: &anyhow::Error) -> bool {
    errno(err) == Some(libc::EEXIST)
}

/// True when the error is an interrupted-dump reply the caller may retry.
pub fn is_dump_interrupted(err: &anyhow::Error) -> bool {
    errno(err) == Some(libc::EINTR)
}

/// True when the kernel reports the operation as unsupported.
pub fn is_not_supported(err: &anyhow::Error) -> bool {
    errno(err) == Some(libc::EOPNOTSUPP)
}
