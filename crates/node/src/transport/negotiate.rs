//! Single round-trip version agreement over a framed stream.
//!
//! The initiator sends its supported versions; the acceptor answers with the
//! first of them it also supports, or with `null` when none match. Both
//! sides fail on `null` and the connection goes no further.

use std::fmt;

use protocol::error::{ProtocolError, Result};
use protocol::version::{
    format_versions, negotiate, ProtocolVersion, VersionAnswer, VersionOffer,
};
use tracing::{debug, warn};

use super::framed::{FrameSink, FrameSource, MessageReader, MessageWriter};

/// Which side of a connection this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialed the peer.
    Initiator,
    /// Accepted the peer's dial.
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Agree on a protocol version with the peer.
pub async fn negotiate_version<S, K>(
    reader: &mut MessageReader<S>,
    writer: &mut MessageWriter<K>,
    role: Role,
    local: &[ProtocolVersion],
) -> Result<ProtocolVersion>
where
    S: FrameSource,
    K: FrameSink,
{
    match role {
        Role::Initiator => {
            let offer = VersionOffer {
                supported_versions: local.to_vec(),
            };
            writer.write(&offer.to_json()?).await?;

            let answer = VersionAnswer::from_json(&reader.read().await?)?;
            match answer.agreed_version {
                Some(version) if local.contains(&version) => {
                    debug!(%version, "Version agreed");
                    Ok(version)
                }
                Some(version) => Err(ProtocolError::VersionRejected(format!(
                    "acceptor chose {} which was not offered",
                    version
                ))),
                None => Err(ProtocolError::NoCommonVersion {
                    local: format_versions(local),
                    remote: "unknown".into(),
                }),
            }
        }
        Role::Acceptor => {
            let offer = VersionOffer::from_json(&reader.read().await?)?;
            let agreed = negotiate(&offer.supported_versions, local);

            let answer = VersionAnswer {
                agreed_version: agreed.as_ref().ok().copied(),
            };
            writer.write(&answer.to_json()?).await?;

            match &agreed {
                Ok(version) => debug!(%version, "Version agreed"),
                Err(err) => warn!(error = %err, "Version negotiation failed"),
            }
            agreed
        }
    }
}

#[cfg(test)]
mod tests {
    use protocol::framing::{FrameCodec, MAX_FRAMES_PER_MESSAGE};
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::transport::framed::{FrameReader, FrameWriter};

    type Reader = MessageReader<FrameReader<ReadHalf<DuplexStream>>>;
    type Writer = MessageWriter<FrameWriter<WriteHalf<DuplexStream>>>;

    fn ends() -> ((Reader, Writer), (Reader, Writer)) {
        let (a, b) = duplex(8192);
        let wrap = |s: DuplexStream| {
            let (r, w) = split(s);
            (
                MessageReader::new(FrameReader::new(r), MAX_FRAMES_PER_MESSAGE),
                MessageWriter::new(FrameWriter::new(w), FrameCodec::default()),
            )
        };
        (wrap(a), wrap(b))
    }

    fn versions(raw: &[u64]) -> Vec<ProtocolVersion> {
        raw.iter().copied().map(ProtocolVersion).collect()
    }

    #[tokio::test]
    async fn test_acceptor_picks_first_in_initiator_order() {
        let ((mut ir, mut iw), (mut ar, mut aw)) = ends();
        let initiator_versions = versions(&[2, 1, 3]);
        let acceptor_versions = versions(&[1, 3]);

        let (i, a) = tokio::join!(
            negotiate_version(&mut ir, &mut iw, Role::Initiator, &initiator_versions),
            negotiate_version(&mut ar, &mut aw, Role::Acceptor, &acceptor_versions),
        );
        assert_eq!(i.unwrap(), ProtocolVersion(1));
        assert_eq!(a.unwrap(), ProtocolVersion(1));
    }

    #[tokio::test]
    async fn test_disjoint_versions_fail_both_sides() {
        let ((mut ir, mut iw), (mut ar, mut aw)) = ends();
        let initiator_versions = versions(&[2]);
        let acceptor_versions = versions(&[1, 3]);

        let (i, a) = tokio::join!(
            negotiate_version(&mut ir, &mut iw, Role::Initiator, &initiator_versions),
            negotiate_version(&mut ar, &mut aw, Role::Acceptor, &acceptor_versions),
        );
        assert!(matches!(i, Err(ProtocolError::NoCommonVersion { .. })));
        assert!(matches!(a, Err(ProtocolError::NoCommonVersion { .. })));
    }
}
