//! 测试用脚本化引擎

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::{EngineFactory, InferenceEngine};
use crate::detection::{Detection, Frame};

#[derive(Default)]
pub(crate) struct EngineScript {
    pub detections: Vec<Detection>,
    pub fail_init: bool,
    pub fail_infer: bool,
    pub init_delay: Duration,
    pub init_calls: usize,
    pub infer_calls: usize,
    pub dropped: usize,
}

pub(crate) type SharedScript = Arc<Mutex<EngineScript>>;

pub(crate) struct ScriptedEngine {
    script: SharedScript,
    loaded: bool,
}

impl InferenceEngine for ScriptedEngine {
    fn initialize(&mut self, _model_path: Option<&Path>, _use_gpu: bool) -> Result<bool> {
        let (delay, fail) = {
            let mut script = self.script.lock();
            script.init_calls += 1;
            (script.init_delay, script.fail_init)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if fail {
            bail!("scripted init failure");
        }
        self.loaded = true;
        Ok(true)
    }

    fn infer(&mut self, _frame: &Frame, _conf: f32, _iou: f32) -> Result<Vec<Detection>> {
        let mut script = self.script.lock();
        script.infer_calls += 1;
        if script.fail_infer {
            bail!("scripted inference failure");
        }
        Ok(script.detections.clone())
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn execution_provider(&self) -> &str {
        "Scripted"
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.script.lock().dropped += 1;
    }
}

pub(crate) fn scripted() -> (SharedScript, Arc<dyn EngineFactory>) {
    let script: SharedScript = Arc::new(Mutex::new(EngineScript::default()));
    let shared = script.clone();
    let factory = move |_camera_id: &str| -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(ScriptedEngine {
            script: shared.clone(),
            loaded: false,
        }))
    };
    (script, Arc::new(factory))
}
