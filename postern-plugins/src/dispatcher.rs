use std::sync::Arc;

use postern_common::{Code, internal};
use tokio::{sync::oneshot, task::JoinError};

use crate::{
    error::{DispatchError, PluginError},
    hook::Hook,
    plugin::{HookArgs, Plugin},
    registry::HookRegistry,
    reply::{Reply, Verdict},
};

/// The resolution of one hook invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub code: Code,
    pub message: Vec<String>,
    /// The plugin that ended the chain, if any did.
    pub plugin: Option<Arc<str>>,
}

impl Outcome {
    /// The plugin's message, or `default` when it gave none.
    #[must_use]
    pub fn message_or(&self, default: impl Into<String>) -> Vec<String> {
        if self.message.is_empty() {
            vec![default.into()]
        } else {
            self.message.clone()
        }
    }
}

/// Tracks the hook currently running on one connection or mail item.
#[derive(Debug, Default)]
pub struct HookState {
    running: Option<Hook>,
}

impl HookState {
    #[must_use]
    pub const fn running(&self) -> Option<Hook> {
        self.running
    }

    /// Mark `hook` as running on this object.
    pub fn begin(&mut self, hook: Hook) -> Result<(), DispatchError> {
        if let Some(running) = self.running {
            return Err(DispatchError::Reentrant {
                running,
                requested: hook,
            });
        }

        self.running = Some(hook);
        Ok(())
    }

    pub fn end(&mut self) {
        self.running = None;
    }
}

struct Running<'a>(&'a mut HookState);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// Runs hook chains against a shared, read-only [`HookRegistry`].
#[derive(Clone, Debug)]
pub struct Dispatcher {
    registry: Arc<HookRegistry>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(HookRegistry::default()))
    }
}

impl Dispatcher {
    #[must_use]
    pub const fn new(registry: Arc<HookRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Run every plugin registered for `hook`, in order, until one answers
    /// with something other than `CONT`.
    ///
    /// Deny answers are first offered to the `deny` hook. A `deny` plugin
    /// answering `OK` cancels the denial and the original chain resumes after
    /// the plugin that denied.
    ///
    /// Fails if `state` already has a hook running.
    #[tracing::instrument(level = "trace", skip_all, fields(%hook, scope = args.subject.scope()))]
    pub async fn run(
        &self,
        hook: Hook,
        state: &mut HookState,
        args: HookArgs,
    ) -> Result<Outcome, DispatchError> {
        state.begin(hook)?;
        let _running = Running(state);

        Ok(self.resolve(hook, args).await)
    }

    async fn resolve(&self, hook: Hook, args: HookArgs) -> Outcome {
        let worklist = self.registry.plugins_for(hook).to_vec();
        let mut start = 0;

        loop {
            let Some((index, outcome)) = self.chain(hook, &worklist[start..], &args).await else {
                return Outcome::default();
            };
            let index = start + index;

            if hook == Hook::Deny || !outcome.code.is_deny() {
                return outcome;
            }

            let denied_by = outcome.plugin.as_deref().unwrap_or_default().to_string();
            let mut params = vec![
                outcome.code.to_string(),
                outcome.message.join(" "),
                denied_by.clone(),
                hook.to_string(),
            ];
            params.extend(args.params.iter().cloned());

            let deny_list = self.registry.plugins_for(Hook::Deny).to_vec();
            let deny_args = args.clone().with_params(params);

            match self.chain(Hook::Deny, &deny_list, &deny_args).await {
                Some((_, deny)) if deny.code == Code::Ok => {
                    internal!(
                        level = INFO,
                        "{} from {denied_by} on {hook} overridden by {}",
                        outcome.code,
                        deny.plugin.as_deref().unwrap_or_default()
                    );
                    start = index + 1;
                }
                _ => return outcome,
            }
        }
    }

    async fn chain(
        &self,
        hook: Hook,
        worklist: &[Arc<dyn Plugin>],
        args: &HookArgs,
    ) -> Option<(usize, Outcome)> {
        for (index, plugin) in worklist.iter().enumerate() {
            let verdict = self.call(plugin, hook, args.clone()).await;

            internal!(
                level = DEBUG,
                "Plugin {} answered {} to {hook}",
                plugin.name(),
                verdict.code
            );

            if verdict.code.is_terminal() {
                return Some((
                    index,
                    Outcome {
                        code: verdict.code,
                        message: verdict.message,
                        plugin: Some(Arc::from(plugin.name())),
                    },
                ));
            }
        }

        None
    }

    /// Invoke one plugin and wait for its single answer.
    ///
    /// The handler runs on its own task, so neither a panic nor a timeout
    /// reaches the caller; work it started keeps running after a timeout.
    async fn call(&self, plugin: &Arc<dyn Plugin>, hook: Hook, args: HookArgs) -> Verdict {
        let name: Arc<str> = Arc::from(plugin.name());
        let timeout = self.registry.timeout_for(plugin.as_ref());

        let (tx, mut rx) = oneshot::channel();
        let reply = Reply::new(tx, Arc::clone(&name), hook);
        let handler = Arc::clone(plugin);
        let mut task = tokio::spawn(async move { handler.handle(hook, args, reply).await });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut returned = false;

        loop {
            tokio::select! {
                biased;

                answer = &mut rx => {
                    if let Ok(verdict) = answer {
                        return verdict;
                    }

                    // Every copy of the reply is gone without an answer.
                    if !returned && failed(&name, hook, (&mut task).await) {
                        return Verdict::cont();
                    }

                    internal!(level = ERROR, "Plugin {name} returned from {hook} without answering");
                    return Verdict::new(Code::DenySoft, "plugin did not answer");
                }

                joined = &mut task, if !returned => {
                    returned = true;
                    if failed(&name, hook, joined) {
                        return Verdict::cont();
                    }
                }

                () = &mut deadline => {
                    internal!(
                        level = ERROR,
                        "Plugin {name} timed out on {hook} after {}s",
                        timeout.as_secs_f64()
                    );
                    return Verdict::new(Code::DenySoft, "plugin timeout");
                }
            }
        }
    }
}

/// Log a handler that errored or panicked; its answer counts as `CONT`.
fn failed(name: &str, hook: Hook, joined: Result<Result<(), PluginError>, JoinError>) -> bool {
    match joined {
        Ok(Ok(())) => false,
        Ok(Err(err)) => {
            internal!(level = ERROR, "Plugin {name} failed on {hook}: {err}");
            true
        }
        Err(err) => {
            internal!(level = ERROR, "Plugin {name} crashed on {hook}: {err}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        modules::test::{Behaviour, CallLog, Scripted},
        notes::Notes,
        plugin::{ConnectionView, Subject},
    };

    fn args() -> HookArgs {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 2525));
        HookArgs::new(
            Subject::Connection(Box::new(ConnectionView {
                id: "conn".to_string(),
                remote: addr,
                local: addr,
                hello: None,
                esmtp: false,
                relaying: false,
                tls: false,
                early_talker: false,
                transaction: None,
            })),
            Notes::new(),
        )
        .with_params(vec!["<c@d>".to_string()])
    }

    fn dispatcher(plugins: Vec<Scripted>) -> Dispatcher {
        let registry = plugins
            .into_iter()
            .fold(HookRegistry::builder(), |builder, plugin| {
                builder.register(Arc::new(plugin))
            })
            .build();

        Dispatcher::new(Arc::new(registry))
    }

    fn called(log: &CallLog) -> Vec<(String, Hook)> {
        log.lock()
            .iter()
            .map(|(name, hook, _)| (name.clone(), *hook))
            .collect()
    }

    async fn run(dispatcher: &Dispatcher, hook: Hook) -> Outcome {
        dispatcher
            .run(hook, &mut HookState::default(), args())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stops_at_first_terminal_code() {
        let log = CallLog::default();
        let dispatcher = dispatcher(vec![
            Scripted::new("p1").on(Hook::Rcpt, Code::Cont).with_log(log.clone()),
            Scripted::new("p2")
                .answer(Hook::Rcpt, Code::Deny, "go away")
                .with_log(log.clone()),
            Scripted::new("p3").on(Hook::Rcpt, Code::Ok).with_log(log.clone()),
        ]);

        let outcome = run(&dispatcher, Hook::Rcpt).await;

        assert_eq!(outcome.code, Code::Deny);
        assert_eq!(outcome.message, vec!["go away".to_string()]);
        assert_eq!(outcome.plugin.as_deref(), Some("p2"));
        assert_eq!(
            called(&log),
            vec![("p1".to_string(), Hook::Rcpt), ("p2".to_string(), Hook::Rcpt)]
        );
    }

    #[tokio::test]
    async fn runs_every_plugin_when_all_continue() {
        let log = CallLog::default();
        let dispatcher = dispatcher(vec![
            Scripted::new("p1").on(Hook::Rcpt, Code::Cont).with_log(log.clone()),
            Scripted::new("p2").on(Hook::Rcpt, Code::Cont).with_log(log.clone()),
            Scripted::new("p3").on(Hook::Rcpt, Code::Cont).with_log(log.clone()),
        ]);

        let outcome = run(&dispatcher, Hook::Rcpt).await;

        assert_eq!(outcome, Outcome::default());
        let names: Vec<_> = called(&log).into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn hook_without_plugins_continues() {
        let outcome = run(&Dispatcher::default(), Hook::Helo).await;
        assert_eq!(outcome.code, Code::Cont);
        assert!(outcome.plugin.is_none());
    }

    #[tokio::test]
    async fn second_answer_is_ignored() {
        let once = dispatcher(vec![
            Scripted::new("p1").answer(Hook::Mail, Code::DenySoft, "later"),
            Scripted::new("p2").on(Hook::Mail, Code::Ok),
        ]);
        let twice = dispatcher(vec![
            Scripted::new("p1").behave(
                Hook::Mail,
                Behaviour::AnswerTwice(Verdict::new(Code::DenySoft, "later")),
            ),
            Scripted::new("p2").on(Hook::Mail, Code::Ok),
        ]);

        assert_eq!(run(&once, Hook::Mail).await, run(&twice, Hook::Mail).await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_soft_deny() {
        let log = CallLog::default();
        let dispatcher = dispatcher(vec![
            Scripted::new("slow")
                .behave(
                    Hook::Data,
                    Behaviour::AnswerAfter(Duration::from_secs(60), Verdict::code(Code::Ok)),
                )
                .with_timeout(Duration::from_secs(1))
                .with_log(log.clone()),
            Scripted::new("next").on(Hook::Data, Code::Ok).with_log(log.clone()),
        ]);

        let outcome = run(&dispatcher, Hook::Data).await;
        assert_eq!(outcome.code, Code::DenySoft);
        assert_eq!(outcome.message, vec!["plugin timeout".to_string()]);
        assert_eq!(called(&log).len(), 1);

        // The late answer lands on a closed channel and is dropped.
        tokio::time::sleep(Duration::from_secs(120)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_answer_within_timeout_counts() {
        let dispatcher = dispatcher(vec![
            Scripted::new("slow")
                .behave(
                    Hook::Data,
                    Behaviour::AnswerAfter(Duration::from_secs(5), Verdict::new(Code::Ok, "fine")),
                )
                .with_timeout(Duration::from_secs(10)),
        ]);

        let outcome = run(&dispatcher, Hook::Data).await;
        assert_eq!(outcome.code, Code::Ok);
        assert_eq!(outcome.message_or("unused"), vec!["fine".to_string()]);
    }

    #[tokio::test]
    async fn panicking_plugin_is_skipped() {
        let dispatcher = dispatcher(vec![
            Scripted::new("boom").behave(Hook::Helo, Behaviour::Panic),
            Scripted::new("after").answer(Hook::Helo, Code::Ok, "hello"),
        ]);

        let outcome = run(&dispatcher, Hook::Helo).await;
        assert_eq!(outcome.code, Code::Ok);
        assert_eq!(outcome.plugin.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn failing_plugin_is_skipped() {
        let dispatcher = dispatcher(vec![
            Scripted::new("broken").behave(Hook::Helo, Behaviour::Fail("no db".to_string())),
            Scripted::new("after").on(Hook::Helo, Code::DenyDisconnect),
        ]);

        let outcome = run(&dispatcher, Hook::Helo).await;
        assert_eq!(outcome.code, Code::DenyDisconnect);
    }

    #[tokio::test]
    async fn silent_plugin_is_a_soft_deny() {
        let dispatcher = dispatcher(vec![
            Scripted::new("mute").behave(Hook::Helo, Behaviour::Silent),
            Scripted::new("after").on(Hook::Helo, Code::Ok),
        ]);

        let outcome = run(&dispatcher, Hook::Helo).await;
        assert_eq!(outcome.code, Code::DenySoft);
        assert_eq!(outcome.plugin.as_deref(), Some("mute"));
    }

    #[tokio::test]
    async fn deny_hook_sees_the_denial() {
        let log = CallLog::default();
        let dispatcher = dispatcher(vec![
            Scripted::new("p1").answer(Hook::Rcpt, Code::Deny, "unknown user"),
            Scripted::new("watcher")
                .on(Hook::Deny, Code::Cont)
                .with_log(log.clone()),
        ]);

        let outcome = run(&dispatcher, Hook::Rcpt).await;
        assert_eq!(outcome.code, Code::Deny);
        assert_eq!(outcome.plugin.as_deref(), Some("p1"));

        let calls = log.lock().clone();
        assert_eq!(
            calls,
            vec![(
                "watcher".to_string(),
                Hook::Deny,
                vec![
                    "DENY".to_string(),
                    "unknown user".to_string(),
                    "p1".to_string(),
                    "rcpt".to_string(),
                    "<c@d>".to_string(),
                ]
            )]
        );
    }

    #[tokio::test]
    async fn deny_hook_can_override() {
        let dispatcher = dispatcher(vec![
            Scripted::new("p1").on(Hook::Rcpt, Code::Deny),
            Scripted::new("p2").answer(Hook::Rcpt, Code::Ok, "accepted"),
            Scripted::new("forgiving").on(Hook::Deny, Code::Ok),
        ]);

        let outcome = run(&dispatcher, Hook::Rcpt).await;
        assert_eq!(outcome.code, Code::Ok);
        assert_eq!(outcome.plugin.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn overridden_denial_at_end_of_chain_continues() {
        let dispatcher = dispatcher(vec![
            Scripted::new("p1").on(Hook::Mail, Code::DenySoft),
            Scripted::new("forgiving").on(Hook::Deny, Code::Ok),
        ]);

        assert_eq!(run(&dispatcher, Hook::Mail).await.code, Code::Cont);
    }

    #[tokio::test]
    async fn reentry_is_refused() {
        let dispatcher = dispatcher(vec![Scripted::new("p1").on(Hook::Rcpt, Code::Ok)]);
        let mut state = HookState::default();

        state.begin(Hook::Rcpt).unwrap();
        let err = dispatcher.run(Hook::Data, &mut state, args()).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::Reentrant {
                running: Hook::Rcpt,
                requested: Hook::Data
            }
        );

        state.end();
        dispatcher.run(Hook::Rcpt, &mut state, args()).await.unwrap();
        assert_eq!(state.running(), None);
    }
}
