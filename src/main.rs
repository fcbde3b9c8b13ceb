use bevy::prelude::*;
use linked_portals::plugins;

fn main() {
    App::new()
        .add_plugin(plugins::game::GamePlugin)
        .run();
}
