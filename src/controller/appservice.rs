//! # AppService Reconciler
//!
//! Realizes an `AppService` as one `Deployment` of the same name.
//!
//! The engine owns the replica count, the main container image and the
//! selector of the child. Anything else on the `Deployment` (extra containers,
//! pause flags, labels added by others) is left to whoever set it.

use crate::controller::reconciler::{
    apply_owned_child, update_status, Action, ChildOutcome, Context, Reconcilable, ReconcileError,
};
use crate::crd::{AppServiceSpec, Condition, Resource, APP_SERVICE_KIND, DEPLOYMENT_KIND};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// JSON pointers into the `Deployment` spec the engine keeps in sync
pub const DEPLOYMENT_OWNED_FIELDS: &[&str] =
    &["/replicas", "/template/containers/0/image", "/selector"];

pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

#[derive(Debug, Default, Clone, Copy)]
pub struct AppServiceReconciler;

impl AppServiceReconciler {
    pub fn new() -> Self {
        Self
    }
}

/// Desired `Deployment` for `app`
pub fn desired_deployment(app: &Resource, spec: &AppServiceSpec) -> Result<Resource, ReconcileError> {
    let body = spec.desired_deployment(app.name());
    let value = serde_json::to_value(&body).map_err(|e| {
        ReconcileError::terminal(REASON_INVALID_SPEC, format!("cannot encode Deployment: {e}"))
    })?;
    let mut child = Resource::new(DEPLOYMENT_KIND, app.namespace(), app.name(), value);
    child.metadata.labels = body.template.labels;
    Ok(child)
}

fn decode_spec(app: &Resource) -> Result<AppServiceSpec, ReconcileError> {
    let spec: AppServiceSpec = app.spec_as().map_err(|e| {
        ReconcileError::terminal(REASON_INVALID_SPEC, format!("spec does not decode: {e}"))
    })?;
    spec.validate()
        .map_err(|message| ReconcileError::terminal(REASON_INVALID_SPEC, message))?;
    Ok(spec)
}

#[async_trait]
impl Reconcilable for AppServiceReconciler {
    fn kind(&self) -> &str {
        APP_SERVICE_KIND
    }

    fn owned_kinds(&self) -> Vec<String> {
        vec![DEPLOYMENT_KIND.to_string()]
    }

    async fn reconcile(&self, app: Arc<Resource>, ctx: &Context) -> Result<Action, ReconcileError> {
        let spec = decode_spec(&app)?;
        let desired = desired_deployment(&app, &spec)?;

        let outcome = apply_owned_child(&ctx.client, &app, &desired, DEPLOYMENT_OWNED_FIELDS).await?;
        match &outcome {
            ChildOutcome::Created => info!(replicas = spec.replicas, image = %spec.image, "Deployment created"),
            ChildOutcome::Updated { fields } => info!(fields = ?fields, "Deployment corrected"),
            ChildOutcome::Unchanged => debug!("Deployment already matches spec"),
        }

        // Derived from the spec alone so an unchanged spec yields an unchanged status
        let message = format!(
            "Deployment {} runs {} replica(s) of {}",
            app.name(),
            spec.replicas,
            spec.image
        );
        let generation = app.metadata.generation;
        update_status(&ctx.client, &app, |status| {
            status.set_condition(Condition::ready(REASON_RECONCILED, message.as_str()));
            status.observed_generation = Some(generation);
        })
        .await?;

        Ok(Action::await_change())
    }
}
