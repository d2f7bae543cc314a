//! Shared bridge interface management over netlink.

use futures_util::TryStreamExt;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use tracing::debug;

use crate::error::{Error, Result};

const EEXIST: i32 = 17;

/// Creates the bridge if absent and brings it administratively up.
///
/// Concurrent callers may race to create the same bridge; "already exists"
/// counts as success. An existing interface of another kind is a
/// configuration conflict.
pub async fn ensure_bridge(name: &str) -> Result<()> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);

    match handle
        .link()
        .add()
        .bridge(name.to_owned())
        .execute()
        .await
    {
        Ok(()) => debug!(bridge = name, "bridge created"),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -EEXIST => {
            debug!(bridge = name, "bridge already exists");
        }
        Err(e) => {
            return Err(Error::Configuration(format!(
                "cannot create bridge {name}: {e}"
            )));
        }
    }

    let link = get_link(&handle, name).await?;
    if !is_bridge(&link) {
        return Err(Error::Configuration(format!(
            "interface {name} already exists but is not a bridge"
        )));
    }

    handle
        .link()
        .set(link.header.index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::Configuration(format!("cannot bring bridge {name} up: {e}")))
}

async fn get_link(handle: &rtnetlink::Handle, name: &str) -> Result<LinkMessage> {
    let mut links = handle.link().get().match_name(name.to_owned()).execute();

    links
        .try_next()
        .await
        .map_err(|e| Error::Configuration(format!("cannot read link {name}: {e}")))?
        .ok_or_else(|| Error::Configuration(format!("link {name} disappeared")))
}

fn is_bridge(link: &LinkMessage) -> bool {
    link.attributes.iter().any(|attribute| match attribute {
        LinkAttribute::LinkInfo(infos) => infos
            .iter()
            .any(|info| matches!(info, LinkInfo::Kind(InfoKind::Bridge))),
        _ => false,
    })
}
