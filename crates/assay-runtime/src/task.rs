//! Single tool invocation.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use assay_catalog::PortValues;
use futures::FutureExt;
use tracing::{debug, instrument, warn};

use crate::capability::ToolExecutor;
use crate::error::ExecutionError;

/// Everything needed to call a tool once.
pub struct ToolInvocation<'a> {
  pub run_id: &'a str,
  pub node_id: &'a str,
  pub tool_id: &'a str,
  pub inputs: PortValues,
  pub timeout_ms: Option<u64>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

/// Call a tool, converting errors, timeouts and panics into [`ExecutionError`]s.
#[instrument(
  name = "tool_invoke",
  skip(tools, invocation),
  fields(
    run_id = %invocation.run_id,
    node_id = %invocation.node_id,
    tool_id = %invocation.tool_id,
  )
)]
pub async fn invoke_tool(
  tools: &dyn ToolExecutor,
  invocation: ToolInvocation<'_>,
) -> Result<PortValues, ExecutionError> {
  let ToolInvocation {
    node_id,
    tool_id,
    inputs,
    timeout_ms,
    ..
  } = invocation;

  let call = AssertUnwindSafe(tools.execute(tool_id, inputs)).catch_unwind();

  let outcome = match timeout_ms {
    Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
      Ok(outcome) => outcome,
      Err(_) => {
        warn!(timeout_ms = ms, "tool_timed_out");
        return Err(ExecutionError::Timeout {
          node_id: node_id.to_string(),
          tool_id: tool_id.to_string(),
          timeout_ms: ms,
        });
      }
    },
    None => call.await,
  };

  match outcome {
    Ok(Ok(outputs)) => {
      debug!(outputs = outputs.len(), "tool_returned");
      Ok(outputs)
    }
    Ok(Err(source)) => Err(ExecutionError::ToolExecution {
      node_id: node_id.to_string(),
      tool_id: tool_id.to_string(),
      source,
    }),
    Err(payload) => {
      let message = panic_message(&*payload);
      warn!(message = %message, "tool_panicked");
      Err(ExecutionError::ToolPanicked {
        node_id: node_id.to_string(),
        tool_id: tool_id.to_string(),
        message,
      })
    }
  }
}
