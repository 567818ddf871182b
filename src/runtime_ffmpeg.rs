//! Post-processing command queue (`ffmpeg.*`).
//!
//! Extensions cannot spawn processes; they queue command strings the outer
//! application executes on their behalf. `execute` blocks the calling VM
//! until the app reports a result (or five minutes pass), `convert` composes
//! a command string from options, and `getInfo` reads the local audio probe
//! directly without crossing the queue.

use crate::probe;
use crate::runtime::{failure_value, json_to_js, opt_value_to_json, ApiState};
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object, Value};
use serde_json::Value as Json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

impl ApiState {
    /// Queue a command and block until the outer app supplies its result.
    pub(crate) fn ffmpeg_execute(&self, command: &str) -> Json {
        let id = self
            .services
            .enqueue_ffmpeg_command(&self.extension.id, command, "", "");

        match self.services.wait_for_ffmpeg_result(&id, COMMAND_TIMEOUT) {
            Some(result) => {
                let mut value = serde_json::json!({
                    "success": result.success,
                    "output": result.output,
                });
                if !result.error.is_empty() {
                    value["error"] = serde_json::json!(result.error);
                }
                value
            }
            None => failure_value("FFmpeg command timed out"),
        }
    }

    pub(crate) fn ffmpeg_get_info(&self, path: &str) -> Json {
        match probe::audio_quality(Path::new(path)) {
            Ok(quality) => serde_json::json!({
                "success": true,
                "bit_depth": quality.bit_depth,
                "sample_rate": quality.sample_rate,
                "total_samples": quality.total_samples,
                "duration": quality.duration_secs(),
            }),
            Err(err) => failure_value(err.to_string()),
        }
    }

    /// Compose a conversion command with shell-quoted paths and forward it to
    /// [`ApiState::ffmpeg_execute`]. The string form is a contract with the
    /// outer app, which owns argument handling.
    pub(crate) fn ffmpeg_convert(&self, input: &str, output: &str, options: &Json) -> Json {
        let mut parts: Vec<String> = vec!["-i".into(), format!("{input:?}")];

        if let Some(codec) = options.get("codec").and_then(Json::as_str) {
            parts.push("-c:a".into());
            parts.push(codec.to_string());
        }
        if let Some(bitrate) = options.get("bitrate").and_then(Json::as_str) {
            parts.push("-b:a".into());
            parts.push(bitrate.to_string());
        }
        if let Some(sample_rate) = options.get("sample_rate").and_then(Json::as_f64) {
            parts.push("-ar".into());
            parts.push(format!("{}", sample_rate as i64));
        }
        if let Some(channels) = options.get("channels").and_then(Json::as_f64) {
            parts.push("-ac".into());
            parts.push(format!("{}", channels as i64));
        }

        parts.push("-y".into());
        parts.push(format!("{output:?}"));

        self.ffmpeg_execute(&parts.join(" "))
    }
}

pub(crate) fn register(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> rquickjs::Result<()> {
    let ffmpeg = Object::new(ctx.clone())?;

    let st = Arc::clone(state);
    ffmpeg.set(
        "execute",
        Func::from(crate::runtime::constrain1(
            move |ctx: Ctx<'_>, command: String| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.ffmpeg_execute(&command))
            },
        )),
    )?;

    let st = Arc::clone(state);
    ffmpeg.set(
        "getInfo",
        Func::from(crate::runtime::constrain1(
            move |ctx: Ctx<'_>, path: String| -> rquickjs::Result<Value> {
                json_to_js(&ctx, &st.ffmpeg_get_info(&path))
            },
        )),
    )?;

    let st = Arc::clone(state);
    ffmpeg.set(
        "convert",
        Func::from(crate::runtime::constrain3(
            move |ctx: Ctx<'_>,
                  input: String,
                  output: String,
                  options: Opt<Value>|
                  -> rquickjs::Result<Value> {
                let options = opt_value_to_json(options.0.as_ref());
                json_to_js(&ctx, &st.ffmpeg_convert(&input, &output, &options))
            },
        )),
    )?;

    ctx.globals().set("ffmpeg", ffmpeg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ExtensionPermissions;
    use crate::probe::test_support::flac_bytes;
    use crate::runtime::test_support::test_extension;
    use crate::runtime::ExtensionRuntime;
    use crate::services::HostServices;

    fn api_state() -> (Arc<ApiState>, Arc<HostServices>) {
        let services = Arc::new(HostServices::new());
        let runtime = ExtensionRuntime::new(
            test_extension(ExtensionPermissions::default()),
            Arc::clone(&services),
        )
        .unwrap();
        (Arc::clone(&runtime.state), services)
    }

    #[test]
    fn execute_roundtrip_with_outer_app() {
        let (state, services) = api_state();

        // Simulated outer app: poll for the queued command and resolve it.
        let worker = {
            let services = Arc::clone(&services);
            std::thread::spawn(move || loop {
                let pending = services.pending_ffmpeg_commands();
                if let Some((id, command)) = pending.first() {
                    assert!(command.command.contains("-i"));
                    services.set_ffmpeg_command_result(id, true, "converted", "");
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            })
        };

        let result = state.ffmpeg_execute("-i \"in.flac\" -y \"out.mp3\"");
        assert_eq!(result["success"], serde_json::json!(true));
        assert_eq!(result["output"], serde_json::json!("converted"));
        worker.join().unwrap();
    }

    #[test]
    fn convert_composes_quoted_command() {
        let (state, services) = api_state();

        let worker = {
            let services = Arc::clone(&services);
            std::thread::spawn(move || loop {
                let pending = services.pending_ffmpeg_commands();
                if let Some((id, command)) = pending.first() {
                    services.set_ffmpeg_command_result(id, true, &command.command, "");
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            })
        };

        let result = state.ffmpeg_convert(
            "in put.flac",
            "out.mp3",
            &serde_json::json!({
                "codec": "libmp3lame",
                "bitrate": "320k",
                "sample_rate": 44100.0,
                "channels": 2.0,
            }),
        );
        worker.join().unwrap();

        let command = result["output"].as_str().unwrap();
        assert!(command.starts_with("-i \"in put.flac\""));
        assert!(command.contains("-c:a libmp3lame"));
        assert!(command.contains("-b:a 320k"));
        assert!(command.contains("-ar 44100"));
        assert!(command.contains("-ac 2"));
        assert!(command.ends_with("-y \"out.mp3\""));
    }

    #[test]
    fn get_info_uses_local_probe() {
        let (state, _services) = api_state();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.flac");
        std::fs::write(&path, flac_bytes(None)).unwrap();

        let info = state.ffmpeg_get_info(path.to_str().unwrap());
        assert_eq!(info["success"], serde_json::json!(true));
        assert_eq!(info["sample_rate"], serde_json::json!(44100));
        assert_eq!(info["bit_depth"], serde_json::json!(16));

        let missing = state.ffmpeg_get_info("/nonexistent/file.flac");
        assert_eq!(missing["success"], serde_json::json!(false));
    }
}
