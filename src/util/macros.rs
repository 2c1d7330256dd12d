/// Run one pipeline stage: honor a pending cancellation at the boundary,
/// record the transition on the run, and execute the body inside a tracing
/// span. Errors from the body come out annotated with the stage they hit.
#[macro_export]
macro_rules! stage {
    ($run:expr, $stage:expr => $body:block) => {{
        $run.enter_stage($stage)
            .map_err(|error| $crate::error::StageError {
                stage: $stage,
                error,
            })?;
        let _span = tracing::info_span!("stage", stage = %$stage).entered();
        tracing::debug!("Entering stage");
        (|| -> Result<_, $crate::error::InstallError> { $body })().map_err(|error| {
            $crate::error::StageError {
                stage: $stage,
                error,
            }
        })?
    }};
}
