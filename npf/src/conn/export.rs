// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Saving and restoring connections across restarts.
//!
//! Keys are saved in their canonical word layout. The interface of a key is saved by name, since
//! interface ids are only meaningful within one run.

use crate::conn::{Conn, ConnDb, ConnError, ConnFlags, ConnKey};
use crate::nat::{NatEntry, NatError, NatPolicy};
use crate::state::ConnState;
use net::interface::{IfId, IfMap};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatInfo {
    /// Id of the policy of the entry, in the configuration it is restored with.
    pub policy: u32,
    pub oaddr: IpAddr,
    pub oport: u16,
    pub taddr: IpAddr,
    pub tport: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnInfo {
    pub forw: Vec<u32>,
    pub back: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifname: Option<String>,
    pub flags: u32,
    pub state: ConnState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<NatInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("malformed connection key {0:?}")]
    Key(Vec<u32>),
    #[error("no nat policy with id {0}")]
    NoPolicy(u32),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Nat(#[from] NatError),
}

/// Snapshot of the live connections of `db`.
#[must_use]
pub fn export_conns(db: &ConnDb, ifmap: &IfMap) -> Vec<ConnInfo> {
    db.conns()
        .iter()
        .map(|conn| {
            let forw = conn.forw_key();
            let inner = conn.lock();
            ConnInfo {
                forw: forw.to_words(),
                back: inner.back.to_words(),
                ifname: forw.ifid().and_then(|ifid| ifmap.name(ifid)),
                flags: (conn.flags() & (ConnFlags::PASS | ConnFlags::GLOBAL)).bits(),
                state: inner.state.clone(),
                nat: inner.nat.as_ref().map(|entry| entry.info()),
            }
        })
        .collect()
}

fn key(words: &[u32], ifid: Option<IfId>) -> Result<ConnKey, ImportError> {
    let mut words = words.to_vec();
    if let Some(ifword) = words.get_mut(1) {
        *ifword = ifid.map_or(0, IfId::get);
    }
    ConnKey::from_words(&words).ok_or(ImportError::Key(words))
}

/// Recreate a saved connection in `db`. Translated connections are attached to the policy
/// `policy` returns for the saved policy id, and their translated port is reserved again.
///
/// # Errors
///
/// Fails if the keys are malformed or taken, or if the policy or the port is not available.
pub fn import_conn(
    db: &ConnDb,
    info: &ConnInfo,
    ifmap: &IfMap,
    policy: impl Fn(u32) -> Option<Arc<NatPolicy>>,
) -> Result<Arc<Conn>, ImportError> {
    let ifid = info.ifname.as_deref().map(|name| ifmap.register(name));
    let forw = key(&info.forw, ifid)?;
    let back = key(&info.back, ifid)?;
    let flags = ConnFlags::from_bits_truncate(info.flags) & (ConnFlags::PASS | ConnFlags::GLOBAL);
    let conn = Arc::new(Conn::new(forw, info.state.clone(), flags, db.clock().now()));
    conn.lock().back = back;
    if let Some(nat) = &info.nat {
        let policy = policy(nat.policy).ok_or(ImportError::NoPolicy(nat.policy))?;
        let entry = NatEntry::import(&policy, &conn, nat)?;
        conn.lock().nat = Some(entry);
    }
    db.insert_imported(&conn, forw, back)?;
    debug!("imported connection {forw}");
    Ok(conn)
}
