//! Built-in plugins and the static table the application loads them from.

use std::sync::Arc;

use async_trait::async_trait;
use postern_common::{Code, internal};

use crate::{
    error::PluginError,
    hook::Hook,
    plugin::{HookArgs, Plugin},
    reply::Reply,
};


type Constructor = fn() -> Arc<dyn Plugin>;

static BUILTIN: &[(&str, Constructor)] = &[
    ("deny_logger", deny_logger),
    ("delivery_logger", delivery_logger),
];

fn deny_logger() -> Arc<dyn Plugin> {
    Arc::new(DenyLogger)
}

fn delivery_logger() -> Arc<dyn Plugin> {
    Arc::new(DeliveryLogger)
}

/// Look up a built-in plugin by name.
pub fn load(name: &str) -> Result<Arc<dyn Plugin>, PluginError> {
    BUILTIN
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, construct)| construct())
        .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))
}

/// Logs every denial passing through the `deny` hook and lets it stand.
#[derive(Debug, Default)]
pub struct DenyLogger;

#[async_trait]
impl Plugin for DenyLogger {
    fn name(&self) -> &'static str {
        "deny_logger"
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::Deny]
    }

    async fn handle(&self, _hook: Hook, args: HookArgs, reply: Reply) -> Result<(), PluginError> {
        if let [code, message, plugin, hook, ..] = args.params.as_slice() {
            internal!(
                level = INFO,
                "[{}] {plugin} answered {code} to {hook}: {message}",
                args.subject.scope()
            );
        }

        reply.send(Code::Cont);
        Ok(())
    }
}

/// Logs the outcome of outbound delivery attempts.
#[derive(Debug, Default)]
pub struct DeliveryLogger;

#[async_trait]
impl Plugin for DeliveryLogger {
    fn name(&self) -> &'static str {
        "delivery_logger"
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::Delivered, Hook::Deferred, Hook::Bounce]
    }

    async fn handle(&self, hook: Hook, args: HookArgs, reply: Reply) -> Result<(), PluginError> {
        if let Some(item) = args.mail_item() {
            internal!(
                level = INFO,
                "{hook} {} to {}: {}",
                item.file,
                item.domain,
                args.params.join(" ")
            );
        }

        reply.send(Code::Cont);
        Ok(())
    }
}
