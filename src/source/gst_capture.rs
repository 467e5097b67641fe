//! V4L2 capture + H.264 encode through GStreamer.
//!
//! Pipeline: `v4l2src ! videoconvert ! videoscale ! videorate ! I420 ! tee`
//! - raw branch: `appsink` with a `new_sample` callback feeding the snapshot sink
//! - encoded branch: `x264enc` in AVC (length-prefixed) framing, pulled by the
//!   drain thread through `try_pull_sample`
//!
//! Decoder configuration arrives as `codec_data` on the encoded caps and is
//! reported as a format change whenever it differs from the last one seen.

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{
    CaptureSession, CaptureSource, CaptureStreams, EncodedBuffer, Encoder, EncoderOutput,
    FrameSinks, Geometry,
};
use crate::frame::{PlanarFrame, Plane};
use crate::framing::parse_avc_config;

#[derive(Clone, Copy, Debug, Default)]
pub struct GstreamerSource;

impl CaptureSource for GstreamerSource {
    fn open(
        &self,
        source_id: &str,
        geometry: Geometry,
        sinks: FrameSinks,
    ) -> Result<CaptureStreams> {
        gst::init().context("initialize gstreamer")?;

        let device = source_id.strip_prefix("v4l2://").unwrap_or(source_id);
        let description = format!(
            "v4l2src device={device} ! videoconvert ! videoscale ! videorate ! \
             video/x-raw,format=I420,width={w},height={h},framerate={fps}/1 ! tee name=t \
             t. ! queue leaky=downstream max-size-buffers=2 ! \
             appsink name=raw sync=false max-buffers=1 drop=true \
             t. ! queue ! x264enc tune=zerolatency speed-preset=ultrafast key-int-max={gop} ! \
             video/x-h264,stream-format=avc,alignment=au ! \
             appsink name=encoded sync=false max-buffers=8",
            device = device,
            w = geometry.width,
            h = geometry.height,
            fps = geometry.fps,
            gop = geometry.fps.saturating_mul(2),
        );
        let pipeline = gst::parse::launch(&description)
            .context("build capture pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let raw = app_sink(&pipeline, "raw")?;
        let encoded = app_sink(&pipeline, "encoded")?;

        let raw_sinks = sinks;
        raw.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    match sample_to_frame(&sample) {
                        Ok(frame) => raw_sinks.raw_frame(frame),
                        Err(err) => log::debug!("raw sample skipped: {:#}", err),
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .context("set capture pipeline to Playing")?;
        log::info!("gstreamer source {} opened at {}", source_id, geometry);

        Ok(CaptureStreams {
            session: Box::new(GstreamerSession {
                pipeline: pipeline.clone(),
                encoded: encoded.clone(),
                closed: AtomicBool::new(false),
            }),
            encoder: Box::new(GstreamerEncoder {
                pipeline,
                appsink: encoded,
                codec_data: None,
                held: None,
            }),
        })
    }
}

fn app_sink(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSink> {
    pipeline
        .by_name(name)
        .with_context(|| format!("{} element missing from pipeline", name))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| anyhow!("{} element has unexpected type", name))
}

struct GstreamerSession {
    pipeline: gst::Pipeline,
    encoded: gst_app::AppSink,
    closed: AtomicBool,
}

impl CaptureSession for GstreamerSession {
    fn request_sync_frame(&self) -> Result<()> {
        let event = gst_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.encoded.send_event(event) {
            return Err(anyhow!("force-key-unit event was not handled"));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pipeline
            .set_state(gst::State::Null)
            .context("set capture pipeline to Null")?;
        Ok(())
    }
}

struct GstreamerEncoder {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    codec_data: Option<Vec<u8>>,
    /// Sample pulled together with a configuration change, emitted next.
    held: Option<gst::Sample>,
}

impl GstreamerEncoder {
    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gst::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Warning(warn) => {
                    log::warn!("gstreamer warning: {}", warn.error());
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn config_change(&mut self, sample: &gst::Sample) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(caps) = sample.caps() else {
            return Ok(None);
        };
        let Some(structure) = caps.structure(0) else {
            return Ok(None);
        };
        let Ok(codec_data) = structure.get::<gst::Buffer>("codec_data") else {
            return Ok(None);
        };
        let map = codec_data.map_readable().context("map codec_data")?;
        if self.codec_data.as_deref() == Some(map.as_slice()) {
            return Ok(None);
        }
        let units = parse_avc_config(map.as_slice())?;
        self.codec_data = Some(map.as_slice().to_vec());
        Ok(Some(units))
    }
}

impl Encoder for GstreamerEncoder {
    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput> {
        self.poll_bus()?;

        let sample = match self.held.take() {
            Some(sample) => sample,
            None => {
                let timeout = gst::ClockTime::from_nseconds(timeout.as_nanos() as u64);
                match self.appsink.try_pull_sample(timeout) {
                    Some(sample) => sample,
                    None if self.appsink.is_eos() => return Ok(EncoderOutput::EndOfStream),
                    None => return Ok(EncoderOutput::Pending),
                }
            }
        };

        if let Some(units) = self.config_change(&sample)? {
            self.held = Some(sample);
            return Ok(EncoderOutput::FormatChanged(units));
        }

        let buffer = sample.buffer().context("encoded sample missing buffer")?;
        let map = buffer.map_readable().context("map encoded buffer")?;
        Ok(EncoderOutput::Buffer(EncodedBuffer {
            data: map.as_slice().to_vec(),
            key_frame: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
            codec_config: buffer.flags().contains(gst::BufferFlags::HEADER),
        }))
    }

    fn stop(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .context("stop encoder pipeline")?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.held = None;
        self.codec_data = None;
        Ok(())
    }
}

fn sample_to_frame(sample: &gst::Sample) -> Result<PlanarFrame> {
    let buffer = sample.buffer().context("raw sample missing buffer")?;
    let caps = sample.caps().context("raw sample missing caps")?;
    let info = gst_video::VideoInfo::from_caps(caps).context("parse raw caps as video info")?;
    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
        .context("map raw frame")?;

    let plane = |index: u32| -> Result<Plane> {
        let data = frame
            .plane_data(index)
            .with_context(|| format!("raw plane {} unavailable", index))?;
        let stride = frame.plane_stride()[index as usize];
        Ok(Plane {
            data: data.to_vec(),
            row_stride: usize::try_from(stride).context("negative plane stride")?,
            pixel_stride: 1,
        })
    };

    Ok(PlanarFrame {
        width: info.width(),
        height: info.height(),
        y: plane(0)?,
        u: plane(1)?,
        v: plane(2)?,
    })
}
