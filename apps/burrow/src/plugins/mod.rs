//! The agent's plug-in pipeline. A plug-in owns its CLI flags, decides
//! whether it is active, contributes config shipped to the edge at
//! registration, and provides request and connection hooks.
//!
//! Hooks run in plug-in registration order; `after_proxy` runs in the
//! same order as `before_proxy`, not reversed. Correlation between
//! `on_request` and the request hooks is carried by an explicit
//! [`RequestContext`] threaded through the dispatch, never by task
//! identity.

pub mod auth;
pub mod ipallow;
pub mod stats;

use std::sync::Arc;

use clap::{ArgMatches, Command};

use burrow_proto::{HttpRequest, HttpResponse};

/// Per-dispatch correlation value handed to every hook of one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub subdomain: String,
    pub req_id: String,
}

pub trait RequestHook: Send + Sync {
    /// May rewrite the request before it is sent to the local server.
    fn before_proxy(&self, _ctx: &RequestContext, request: HttpRequest) -> HttpRequest {
        request
    }

    /// May rewrite the response before it is returned to the edge.
    fn after_proxy(
        &self,
        _ctx: &RequestContext,
        _request: &HttpRequest,
        response: HttpResponse,
    ) -> HttpResponse {
        response
    }
}

pub trait ConnectionHook: Send + Sync {
    fn on_connect(&self, _subdomain: &str, _port: u16) {}
    fn on_disconnect(&self, _subdomain: &str, _error: Option<&str>) {}
    /// Fires before `before_proxy` on the same dispatch, with the same
    /// context value.
    fn on_request(&self, _ctx: &RequestContext) {}
}

pub trait Plugin: Send + Sync {
    /// Short identifier, e.g. "stats".
    fn name(&self) -> &'static str;
    /// Contribute CLI flags; called before argument parsing.
    fn register_flags(&self, command: Command) -> Command;
    /// Read parsed flag values; called once after argument parsing.
    fn configure(&mut self, matches: &ArgMatches);
    fn enabled(&self) -> bool;
    /// Key-value pairs merged into the tunnel config sent to the edge
    /// during registration. `None` when there is nothing to send.
    fn worker_config(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        None
    }
    fn request_hooks(&self) -> Vec<Arc<dyn RequestHook>> {
        Vec::new()
    }
    fn connection_hooks(&self) -> Vec<Arc<dyn ConnectionHook>> {
        Vec::new()
    }
}

/// Runs registered hooks in order. Zero-value is ready to use.
#[derive(Default)]
pub struct Pipeline {
    plugins: Vec<Box<dyn Plugin>>,
    request_hooks: Vec<Arc<dyn RequestHook>>,
    connection_hooks: Vec<Arc<dyn ConnectionHook>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plug-in. Call before `register_flags`.
    pub fn register_plugin(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Let every plug-in add its flags to the command.
    pub fn register_flags(&self, mut command: Command) -> Command {
        for plugin in &self.plugins {
            command = plugin.register_flags(command);
        }
        command
    }

    /// Hand parsed flags to every plug-in.
    pub fn configure(&mut self, matches: &ArgMatches) {
        for plugin in &mut self.plugins {
            plugin.configure(matches);
        }
    }

    /// Collect hooks from the enabled plug-ins, in registration order.
    pub fn activate(&mut self) {
        for plugin in &self.plugins {
            if !plugin.enabled() {
                continue;
            }
            self.request_hooks.extend(plugin.request_hooks());
            self.connection_hooks.extend(plugin.connection_hooks());
        }
    }

    /// Union of all enabled plug-ins' worker configs; later plug-ins
    /// win on key conflicts.
    pub fn worker_config(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let mut merged = serde_json::Map::new();
        for plugin in &self.plugins {
            if !plugin.enabled() {
                continue;
            }
            if let Some(config) = plugin.worker_config() {
                for (key, value) in config {
                    merged.insert(key, value);
                }
            }
        }
        if merged.is_empty() {
            None
        } else {
            Some(merged)
        }
    }

    /// Directly add a hook, bypassing the plug-in layer.
    pub fn add_request_hook(&mut self, hook: Arc<dyn RequestHook>) {
        self.request_hooks.push(hook);
    }

    pub fn add_connection_hook(&mut self, hook: Arc<dyn ConnectionHook>) {
        self.connection_hooks.push(hook);
    }

    pub fn run_before_proxy(&self, ctx: &RequestContext, mut request: HttpRequest) -> HttpRequest {
        for hook in &self.request_hooks {
            request = hook.before_proxy(ctx, request);
        }
        request
    }

    pub fn run_after_proxy(
        &self,
        ctx: &RequestContext,
        request: &HttpRequest,
        mut response: HttpResponse,
    ) -> HttpResponse {
        for hook in &self.request_hooks {
            response = hook.after_proxy(ctx, request, response);
        }
        response
    }

    pub fn notify_connect(&self, subdomain: &str, port: u16) {
        for hook in &self.connection_hooks {
            hook.on_connect(subdomain, port);
        }
    }

    pub fn notify_disconnect(&self, subdomain: &str, error: Option<&str>) {
        for hook in &self.connection_hooks {
            hook.on_disconnect(subdomain, error);
        }
    }

    pub fn notify_request(&self, ctx: &RequestContext) {
        for hook in &self.connection_hooks {
            hook.on_request(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    }

    impl RequestHook for Recorder {
        fn before_proxy(&self, _ctx: &RequestContext, request: HttpRequest) -> HttpRequest {
            self.log.lock().unwrap().push(format!("before:{}", self.tag));
            request
        }

        fn after_proxy(
            &self,
            _ctx: &RequestContext,
            _request: &HttpRequest,
            response: HttpResponse,
        ) -> HttpResponse {
            self.log.lock().unwrap().push(format!("after:{}", self.tag));
            response
        }
    }

    #[test]
    fn hooks_run_in_registration_order_both_directions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.add_request_hook(Arc::new(Recorder {
            log: log.clone(),
            tag: "a",
        }));
        pipeline.add_request_hook(Arc::new(Recorder {
            log: log.clone(),
            tag: "b",
        }));

        let ctx = RequestContext {
            subdomain: "abcd".into(),
            req_id: "r1".into(),
        };
        let request = HttpRequest {
            id: "r1".into(),
            method: "GET".into(),
            path: "/".into(),
            headers: Default::default(),
            body: None,
        };
        let response = HttpResponse {
            id: "r1".into(),
            status: 200,
            headers: Default::default(),
            body: None,
        };

        let request = pipeline.run_before_proxy(&ctx, request);
        pipeline.run_after_proxy(&ctx, &request, response);

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["before:a", "before:b", "after:a", "after:b"]
        );
    }
}
