//! Engine backed by an external executable
//!
//! Each operation runs `{program} {args...} <operation>` with a JSON
//! document on stdin:
//!
//! ```json
//! {"butler": {"instrument": "hsc", "root": "/data/rerun/cosmos"}, "request": {...}}
//! ```
//!
//! and expects a JSON response on stdout. A non-zero exit status is an
//! engine failure; stderr is kept in the error message.

use super::{
    FilterFramesRequest, FinalizeRequest, MeasureRequest, MosaicEngine, StackEngine, StackInit,
    StackInitRequest, TileRequest,
};
use crate::butler::DataButler;
use crate::config::EngineSettings;
use crate::error::{ErrorCode, Result, StackError};
use crate::subprocess::{ProcessCommand, ProcessRunner};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const STDERR_TAIL_LINES: usize = 20;

pub struct CommandEngine {
    runner: Arc<dyn ProcessRunner>,
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct FilterFramesResponse {
    visits: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct MeasureResponse {
    sigma: Option<f64>,
}

impl CommandEngine {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: &EngineSettings) -> Self {
        Self {
            runner,
            program: settings.program.clone(),
            args: settings.args.clone(),
            timeout: settings.timeout(),
        }
    }

    async fn invoke<Req, Resp>(
        &self,
        operation: &str,
        butler: &dyn DataButler,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = json!({
            "butler": {
                "instrument": butler.instrument(),
                "root": butler.root(),
            },
            "request": request,
        });

        let command = ProcessCommand::new(self.program.as_str())
            .args(self.args.iter().cloned())
            .arg(operation)
            .timeout(self.timeout)
            .stdin(payload.to_string());

        debug!("Engine {} via {}", operation, self.program);
        let output = self
            .runner
            .run(command)
            .await
            .map_err(|e| StackError::from(e).with_context(operation))?;

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr);
            warn!("Engine {} failed ({:?}): {}", operation, output.status, tail);
            return Err(StackError::engine_with_code(
                ErrorCode::ENGINE_FAILED,
                format!("{} exited with {:?}: {}", self.program, output.status, tail),
                Some(operation.to_string()),
            ));
        }

        let stdout = output.stdout.trim();
        let response = if stdout.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(stdout).map_err(|e| {
                StackError::engine_with_code(
                    ErrorCode::ENGINE_BAD_RESPONSE,
                    "engine response is not JSON",
                    Some(operation.to_string()),
                )
                .with_source(e)
            })?
        };

        serde_json::from_value(response).map_err(|e| {
            StackError::engine_with_code(
                ErrorCode::ENGINE_BAD_RESPONSE,
                "unexpected engine response",
                Some(operation.to_string()),
            )
            .with_source(e)
        })
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl MosaicEngine for CommandEngine {
    async fn filter_frames(
        &self,
        butler: &dyn DataButler,
        visits: &[i64],
        ccds: &[u32],
        output_dir: &Path,
    ) -> Result<Vec<i64>> {
        let request = FilterFramesRequest {
            visits: visits.to_vec(),
            ccds: ccds.to_vec(),
            output_dir: output_dir.to_path_buf(),
        };
        let response: FilterFramesResponse =
            self.invoke("filter-frames", butler, &request).await?;
        Ok(response.visits)
    }
}

#[async_trait]
impl StackEngine for CommandEngine {
    async fn stack_init(
        &self,
        butler: &dyn DataButler,
        request: &StackInitRequest,
    ) -> Result<StackInit> {
        self.invoke("stack-init", butler, request).await
    }

    async fn measure_warped_psf(
        &self,
        butler: &dyn DataButler,
        request: &MeasureRequest,
    ) -> Result<Option<f64>> {
        let response: MeasureResponse = self.invoke("measure-psf", butler, request).await?;
        Ok(response.sigma)
    }

    async fn stack_execute(&self, butler: &dyn DataButler, request: &TileRequest) -> Result<()> {
        let _: Value = self.invoke("stack-execute", butler, request).await?;
        Ok(())
    }

    async fn stack_finalize(
        &self,
        butler: &dyn DataButler,
        request: &FinalizeRequest,
    ) -> Result<()> {
        let _: Value = self.invoke("stack-finalize", butler, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::butler::FsButler;
    use crate::instrument::Instrument;
    use crate::stack::Wcs;
    use crate::subprocess::MockProcessRunner;
    use std::path::PathBuf;

    fn engine_with(mock: &MockProcessRunner, args: &[&str]) -> CommandEngine {
        let settings = EngineSettings {
            program: "stacker".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_secs: Some(60),
        };
        CommandEngine::new(Arc::new(mock.clone()), &settings)
    }

    fn butler() -> FsButler {
        FsButler::new(Instrument::Hsc, "/data/rerun/cosmos")
    }

    #[tokio::test]
    async fn test_filter_frames_sends_request_and_parses_visits() {
        let mock = MockProcessRunner::new();
        mock.on("stacker")
            .for_operation("filter-frames")
            .stdout(r#"{"visits": [1234, 1240]}"#)
            .install();

        let engine = engine_with(&mock, &["--quiet"]);
        let visits = engine
            .filter_frames(&butler(), &[1234, 1236, 1240], &[0, 1], Path::new("/work"))
            .await
            .unwrap();
        assert_eq!(visits, vec![1234, 1240]);

        let history = mock.calls();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].args, vec!["--quiet", "filter-frames"]);
        assert_eq!(history[0].timeout, Some(Duration::from_secs(60)));
        let sent: Value = serde_json::from_str(history[0].stdin.as_deref().unwrap()).unwrap();
        assert_eq!(sent["butler"]["instrument"], "hsc");
        assert_eq!(sent["butler"]["root"], "/data/rerun/cosmos");
        assert_eq!(sent["request"]["visits"], json!([1234, 1236, 1240]));
        assert_eq!(sent["request"]["output_dir"], "/work");
    }

    #[tokio::test]
    async fn test_stack_init_response() {
        let mock = MockProcessRunner::new();
        mock.on("stacker")
            .stdout(r#"{"nx": 2, "ny": 3, "file_list": ["/a.fits"], "wcs": {"crpix": [1, 1]}}"#)
            .install();

        let engine = engine_with(&mock, &[]);
        let request = StackInitRequest {
            files: vec![PathBuf::from("/a.fits"), PathBuf::from("/b.fits")],
            sub_img_size: 4096,
            img_margin: 256,
            file_io: true,
            write_pbs_script: false,
            work_dir: PathBuf::from("/work/COSMOS_0/W-S-I+"),
            skip_mosaic: false,
            rerun: "cosmos".to_string(),
            instrument: Instrument::Hsc,
            program: "COSMOS_0".to_string(),
            filter: "W-S-I+".to_string(),
            date_obs: None,
            dest_wcs: None,
        };
        let init = engine.stack_init(&butler(), &request).await.unwrap();
        assert_eq!((init.nx, init.ny), (2, 3));
        assert_eq!(init.file_list, vec![PathBuf::from("/a.fits")]);
        assert_eq!(init.wcs, Wcs(json!({"crpix": [1, 1]})));
        assert_eq!(mock.calls()[0].args, vec!["stack-init"]);
    }

    #[tokio::test]
    async fn test_measure_may_return_no_sigma() {
        let mock = MockProcessRunner::new();
        mock.on("stacker").stdout(r#"{"sigma": null}"#).install();

        let engine = engine_with(&mock, &[]);
        let request = MeasureRequest {
            file: PathBuf::from("/a.fits"),
            wcs: None,
            file_io: true,
            skip_mosaic: false,
        };
        assert_eq!(
            engine.measure_warped_psf(&butler(), &request).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_execute_accepts_empty_stdout() {
        let mock = MockProcessRunner::new();
        mock.on("stacker").install();

        let engine = engine_with(&mock, &[]);
        let request = FinalizeRequest {
            stack_id: 220,
            sub_img_size: 4096,
            img_margin: 256,
            file_io: true,
            work_dir: PathBuf::from("/work"),
            filter: "W-S-I+".to_string(),
        };
        engine.stack_finalize(&butler(), &request).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_engine_failure() {
        let mock = MockProcessRunner::new();
        mock.on("stacker")
            .exit_code(3)
            .stderr("reading CORR0001234000.fits\nsegmentation fault")
            .install();

        let engine = engine_with(&mock, &[]);
        let err = engine
            .filter_frames(&butler(), &[1], &[0], Path::new("/work"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ENGINE_FAILED);
        assert!(err.to_string().contains("segmentation fault"));
    }

    #[tokio::test]
    async fn test_garbage_stdout_is_bad_response() {
        let mock = MockProcessRunner::new();
        mock.on("stacker").stdout("nx=2 ny=3").install();

        let engine = engine_with(&mock, &[]);
        let err = engine
            .filter_frames(&butler(), &[1], &[0], Path::new("/work"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ENGINE_BAD_RESPONSE);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(&stderr);
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
    }
}
