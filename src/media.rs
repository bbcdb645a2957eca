//! One decodable audio track inside a probed container.
//!
//! [`AudioTrack`] owns the symphonia format reader and the codec decoder for the first track
//! that carries audio with a known sample rate. Corrupt frames are skipped and counted; a
//! source where nothing decodes is an error rather than an empty waveform.

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::AudioBufferRef;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Read-ahead buffer for probing; symphonia wants a power of two above 32 KiB.
const PROBE_BUFFER_BYTES: usize = 256 * 1024;

/// Outcome of pulling one packet from the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pull {
    /// A buffer was decoded and handed to the callback.
    Decoded,
    /// The packet belonged to another track or held a corrupt frame.
    Skipped,
    /// The container has no more packets.
    End,
}

pub(crate) struct AudioTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    declared_frames: Option<u64>,
    decoded: u64,
    corrupt: u64,
}

impl AudioTrack {
    /// Probe `source` and prepare a decoder for its first usable audio track.
    pub(crate) fn open(source: Box<dyn MediaSource>, hint_extension: Option<&str>) -> Result<Self> {
        let stream = MediaSourceStream::new(
            source,
            MediaSourceStreamOptions {
                buffer_len: PROBE_BUFFER_BYTES,
            },
        );

        let mut hint = Hint::new();
        if let Some(ext) = hint_extension {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                stream,
                &FormatOptions {
                    enable_gapless: true,
                    ..FormatOptions::default()
                },
                &MetadataOptions::default(),
            )
            .map_err(|e| anyhow!(e))
            .context("unrecognized or unsupported audio container")?;
        let format = probed.format;

        let (track_id, params) = format
            .tracks()
            .iter()
            .find(|t| {
                t.codec_params.codec != CODEC_TYPE_NULL
                    && t.codec_params.sample_rate.is_some_and(|r| r > 0)
            })
            .map(|t| (t.id, t.codec_params.clone()))
            .ok_or_else(|| anyhow!("container has no audio track with a known sample rate"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| anyhow!(e))
            .context("unsupported audio codec")?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate: params.sample_rate.unwrap_or_default(),
            declared_frames: params.n_frames,
            decoded: 0,
            corrupt: 0,
        })
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frame count from the container header, when it declares one.
    pub(crate) fn declared_frames(&self) -> Option<u64> {
        self.declared_frames
    }

    /// Decode the next packet of the selected track into `on_buffer`.
    ///
    /// An IO error from the container is the end of the stream (that is how symphonia reports
    /// EOF). A corrupt frame is skipped.
    pub(crate) fn pull(
        &mut self,
        on_buffer: impl FnOnce(AudioBufferRef<'_>) -> Result<()>,
    ) -> Result<Pull> {
        let packet = match self.format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(_)) => return Ok(Pull::End),
            Err(e) => return Err(anyhow!(e)).context("failed to read the next packet"),
        };
        if packet.track_id() != self.track_id {
            return Ok(Pull::Skipped);
        }

        match self.decoder.decode(&packet) {
            Ok(buf) => {
                self.decoded += 1;
                on_buffer(buf)?;
                Ok(Pull::Decoded)
            }
            Err(SymphoniaError::DecodeError(reason)) => {
                self.corrupt += 1;
                debug!(reason, "skipping corrupt audio frame");
                Ok(Pull::Skipped)
            }
            Err(SymphoniaError::IoError(_)) => Ok(Pull::End),
            Err(e) => Err(anyhow!(e)).context("audio decoder failed"),
        }
    }

    /// Check that the track produced audio at all.
    pub(crate) fn finish(self) -> Result<()> {
        if self.decoded == 0 {
            if self.corrupt > 0 {
                bail!("none of the {} audio frames could be decoded", self.corrupt);
            }
            bail!("audio track contains no frames");
        }
        if self.corrupt > 0 {
            debug!(decoded = self.decoded, corrupt = self.corrupt, "decoded with skipped frames");
        }
        Ok(())
    }
}
