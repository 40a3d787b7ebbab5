//! Update cycle tests driving the orchestrator through its collaborators.

mod support;
