//! Capability negotiation
//!
//! Loading the router's RTP capabilities against what the local media engine
//! supports yields a [`Device`]: the codecs this client may send and the
//! capabilities it advertises when consuming. Nothing media-related may run
//! before a device is loaded.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::rtp::{MediaKind, RtpCapabilities, RtpCodecCapability};

/// Negotiated capabilities of the local runtime against one router
#[derive(Debug, Clone)]
pub struct Device {
    router: RtpCapabilities,
    negotiated: RtpCapabilities,
}

impl Device {
    /// Intersect router and local capabilities.
    ///
    /// Router order is kept. RTX codecs are kept only next to a kept codec
    /// whose payload type they repair.
    pub fn load(router: RtpCapabilities, local: &RtpCapabilities) -> Result<Self> {
        let mut codecs: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|codec| !codec.is_rtx())
            .filter(|codec| local.codecs.iter().any(|l| l.matches(codec)))
            .cloned()
            .collect();

        if codecs.is_empty() {
            return Err(Error::IncompatibleCapabilities(
                "no router codec is supported locally".to_string(),
            ));
        }

        let local_rtx = local.codecs.iter().any(RtpCodecCapability::is_rtx);
        if local_rtx {
            let kept: Vec<u8> = codecs
                .iter()
                .filter_map(|c| c.preferred_payload_type)
                .collect();
            let rtx = router.codecs.iter().filter(|codec| {
                codec.is_rtx()
                    && codec
                        .associated_payload_type()
                        .is_some_and(|apt| kept.contains(&apt))
            });
            codecs.extend(rtx.cloned());
        }

        let header_extensions = router
            .header_extensions
            .iter()
            .filter(|ext| {
                local
                    .header_extensions
                    .iter()
                    .any(|l| l.kind == ext.kind && l.uri == ext.uri)
            })
            .cloned()
            .collect();

        let negotiated = RtpCapabilities {
            codecs,
            header_extensions,
        };

        info!(
            codecs = negotiated.codecs.len(),
            audio = negotiated.supports(MediaKind::Audio),
            video = negotiated.supports(MediaKind::Video),
            "Router capabilities loaded"
        );

        Ok(Self { router, negotiated })
    }

    /// Whether media of `kind` can be sent to this router
    #[must_use]
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.negotiated.supports(kind)
    }

    /// Capabilities advertised when consuming
    #[must_use]
    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.negotiated
    }

    #[must_use]
    pub const fn router_capabilities(&self) -> &RtpCapabilities {
        &self.router
    }
}

/// Holder enforcing load-once, load-before-use
#[derive(Debug, Default)]
pub struct CapabilityNegotiator {
    device: Option<Arc<Device>>,
}

impl CapabilityNegotiator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, router: RtpCapabilities, local: &RtpCapabilities) -> Result<Arc<Device>> {
        if self.device.is_some() {
            return Err(Error::AlreadyLoaded);
        }
        let device = Arc::new(Device::load(router, local)?);
        self.device = Some(Arc::clone(&device));
        Ok(device)
    }

    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Result<Arc<Device>> {
        self.device.clone().ok_or(Error::NotLoaded)
    }

    /// False (and logged) before load
    #[must_use]
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        match &self.device {
            Some(device) => device.can_produce(kind),
            None => {
                debug!(%kind, "can_produce queried before capabilities were loaded");
                false
            }
        }
    }

    pub fn reset(&mut self) {
        self.device = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpHeaderExtension;

    fn opus() -> RtpCodecCapability {
        RtpCodecCapability::new(MediaKind::Audio, "audio/opus", 48000)
            .with_channels(2)
            .with_payload_type(100)
    }

    fn vp8() -> RtpCodecCapability {
        RtpCodecCapability::new(MediaKind::Video, "video/VP8", 90000).with_payload_type(101)
    }

    fn h264() -> RtpCodecCapability {
        RtpCodecCapability::new(MediaKind::Video, "video/H264", 90000).with_payload_type(103)
    }

    fn rtx(apt: u8, pt: u8) -> RtpCodecCapability {
        RtpCodecCapability::new(MediaKind::Video, "video/rtx", 90000)
            .with_payload_type(pt)
            .with_parameter("apt", apt)
    }

    fn caps(codecs: Vec<RtpCodecCapability>) -> RtpCapabilities {
        RtpCapabilities {
            codecs,
            header_extensions: Vec::new(),
        }
    }

    #[test]
    fn test_intersection_keeps_router_order() {
        let router = caps(vec![opus(), h264(), vp8()]);
        let local = caps(vec![vp8(), opus(), h264()]);

        let device = Device::load(router, &local).unwrap();
        let mimes: Vec<_> = device
            .rtp_capabilities()
            .codecs
            .iter()
            .map(|c| c.mime_type.as_str())
            .collect();
        assert_eq!(mimes, vec!["audio/opus", "video/H264", "video/VP8"]);
    }

    #[test]
    fn test_rtx_follows_its_codec() {
        let router = caps(vec![vp8(), rtx(101, 102), h264(), rtx(103, 104)]);
        let local = caps(vec![vp8(), rtx(0, 0)]);

        let device = Device::load(router, &local).unwrap();
        let codecs = &device.rtp_capabilities().codecs;
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[1].associated_payload_type(), Some(101));
    }

    #[test]
    fn test_audio_only_device_cannot_produce_video() {
        let router = caps(vec![opus(), vp8()]);
        let local = caps(vec![opus()]);

        let device = Device::load(router, &local).unwrap();
        assert!(device.can_produce(MediaKind::Audio));
        assert!(!device.can_produce(MediaKind::Video));
    }

    #[test]
    fn test_no_common_codec_is_incompatible() {
        let router = caps(vec![h264()]);
        let local = caps(vec![vp8(), rtx(101, 102)]);

        let err = Device::load(router, &local).unwrap_err();
        assert!(matches!(err, Error::IncompatibleCapabilities(_)));
    }

    #[test]
    fn test_header_extensions_intersect_by_uri() {
        let ext = |uri: &str, id| RtpHeaderExtension {
            kind: MediaKind::Video,
            uri: uri.to_string(),
            preferred_id: id,
        };
        let mut router = caps(vec![vp8()]);
        router.header_extensions = vec![ext("urn:ietf:params:rtp-hdrext:sdes:mid", 1), ext("urn:3gpp:video-orientation", 4)];
        let mut local = caps(vec![vp8()]);
        local.header_extensions = vec![ext("urn:ietf:params:rtp-hdrext:sdes:mid", 9)];

        let device = Device::load(router, &local).unwrap();
        let exts = &device.rtp_capabilities().header_extensions;
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0].preferred_id, 1);
    }

    #[test]
    fn test_negotiator_guards() {
        let mut negotiator = CapabilityNegotiator::new();
        assert!(matches!(negotiator.device(), Err(Error::NotLoaded)));
        assert!(!negotiator.can_produce(MediaKind::Audio));

        negotiator.load(caps(vec![opus()]), &caps(vec![opus()])).unwrap();
        assert!(negotiator.is_loaded());
        assert!(negotiator.can_produce(MediaKind::Audio));

        let again = negotiator.load(caps(vec![opus()]), &caps(vec![opus()]));
        assert!(matches!(again, Err(Error::AlreadyLoaded)));

        negotiator.reset();
        assert!(!negotiator.is_loaded());
    }
}
