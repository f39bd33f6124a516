//! Compile-time plugin registry.
//!
//! A plugin gets the command registry, the hook bus, and a config
//! snapshot; the built-in set covers the day-to-day proxy commands.
//! External plugins link in through the same trait.

use std::sync::Arc;

use growgate_core::command::CommandRegistry;
use growgate_core::config::Config;
use growgate_core::hooks::HookBus;

use crate::relay::Services;

pub struct PluginApi<'a> {
    pub commands: &'a mut CommandRegistry<Services>,
    pub hooks: &'a mut HookBus<Services>,
    pub config: Arc<Config>,
}

pub trait Plugin {
    fn name(&self) -> &'static str;
    fn install(&self, api: &mut PluginApi<'_>);
}

pub fn install_builtins(api: &mut PluginApi<'_>) {
    for plugin in builtins() {
        tracing::info!("plugins.install name={}", plugin.name());
        plugin.install(api);
    }
}

fn builtins() -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(WarpPlugin),
        Box::new(SessionPlugin),
        Box::new(AppearancePlugin),
        Box::new(WorldInfoPlugin),
    ]
}

/// `warp <world>` — join a world through an injected join request.
struct WarpPlugin;

impl Plugin for WarpPlugin {
    fn name(&self) -> &'static str {
        "warp"
    }

    fn install(&self, api: &mut PluginApi<'_>) {
        api.commands.register("warp", |services: &mut Services, args| {
            let Some(world) = args.first() else {
                services.injector.send_log("`4usage:`` warp <world>");
                return Ok(());
            };
            let world = world.to_uppercase();
            services
                .injector
                .send_log(&format!("`9warping to {world}..."));
            services.injector.send_join_request(&world, "0");
            Ok(())
        });
    }
}

/// `exit` — leave the current world via quit-to-exit.
struct SessionPlugin;

impl Plugin for SessionPlugin {
    fn name(&self) -> &'static str {
        "session"
    }

    fn install(&self, api: &mut PluginApi<'_>) {
        api.commands.register("exit", |services: &mut Services, _args| {
            services.injector.send_quit_to_exit();
            Ok(())
        });
    }
}

/// `name <text>` and `skin <id>` — client-side appearance overrides for
/// the local player.
struct AppearancePlugin;

impl Plugin for AppearancePlugin {
    fn name(&self) -> &'static str {
        "appearance"
    }

    fn install(&self, api: &mut PluginApi<'_>) {
        api.commands.register("name", |services: &mut Services, args| {
            let net_id = services.world.local_net_id();
            if net_id < 0 {
                services.injector.send_log("`4no local player yet``");
                return Ok(());
            }
            if args.is_empty() {
                services.injector.send_log("`4usage:`` name <text>");
                return Ok(());
            }
            services.injector.send_name_changed(net_id, &args.join(" "));
            Ok(())
        });

        api.commands.register("skin", |services: &mut Services, args| {
            let net_id = services.world.local_net_id();
            if net_id < 0 {
                services.injector.send_log("`4no local player yet``");
                return Ok(());
            }
            let Some(skin) = args.first().and_then(|arg| arg.parse::<u32>().ok()) else {
                services.injector.send_log("`4usage:`` skin <id>");
                return Ok(());
            };
            services.injector.send_skin_change(net_id, skin);
            Ok(())
        });
    }
}

/// `who` — list the participants the proxy has seen spawn.
struct WorldInfoPlugin;

impl Plugin for WorldInfoPlugin {
    fn name(&self) -> &'static str {
        "world-info"
    }

    fn install(&self, api: &mut PluginApi<'_>) {
        api.commands.register("who", |services: &mut Services, _args| {
            let mut names: Vec<String> = services
                .world
                .iter()
                .map(|p| format!("{} (net {})", p.name, p.net_id))
                .collect();
            names.sort();
            let line = if names.is_empty() {
                "`4nobody here``".to_string()
            } else {
                format!("`2{}``", names.join(", "))
            };
            services.injector.send_log(&line);
            Ok(())
        });
    }
}
