//! Linked portals.
//!
//! The simulation core ([`PortalPair`]) and the view compositor ([`RecursiveViewCompositor`]) know
//! nothing of the ECS. The systems in this module feed them the world state every frame and apply
//! their results back to rapier bodies, cameras and surface quads.
//!
//! Render setup: portal `P` owns one camera per recursion level `k`, rendering into its own image.
//! Each surface owns an open and a closed quad per level on a dedicated render layer. Camera
//! `(P, k)` sees the world plus the level `k` quads of the other surface, whose open quad samples
//! the image of camera `(P, k + 1)`. Deeper cameras get lower priorities so they render first.

use std::f32::consts::FRAC_PI_4;

use bevy::{
    prelude::*,
    reflect::FromReflect,
    render::{
        camera::{CameraProjectionPlugin, CameraUpdateSystem, Projection, RenderTarget},
        render_resource::{
            Extent3d, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages,
        },
        view::{update_frusta, RenderLayers},
    },
    transform::TransformSystem,
    utils::{HashMap, HashSet},
};
use bevy_rapier3d::prelude::*;

pub mod camera_projection;
pub mod compositor;
pub mod config;
pub mod crossing;
pub mod geometry;
pub mod material;
pub mod pair;
pub mod surface;
pub mod teleport;

use camera_projection::PortalCameraProjection;
use compositor::{FrameInfo, RecursionFrame, RecursiveViewCompositor, ViewCommand, ViewRecorder};
use config::PortalConfig;
use crossing::{BodyKind, TrackedObject};
use material::{ClosedPortalMaterial, OpenPortalMaterial, PortalUniform};
use pair::{PlacementOutcome, PortalEvent, PortalFireRequest, PortalPair};
use surface::{PortalId, SurfaceAppearance};

use super::{first_person_controller::*, physics::*};

/// First render layer used by portal quads, layer 0 is the world.
pub const PORTAL_LAYER_BASE: u8 = 1;
const DEFAULT_TARGET_SIZE: UVec2 = UVec2::new(1280, 720);

/// Render layer of the quads of `surface` at recursion `level`.
pub fn surface_layer(surface: PortalId, level: u32) -> u8 {
    PORTAL_LAYER_BASE + (level * 2) as u8 + surface.index() as u8
}

/// Deeper levels render first, and all of them before the main camera.
pub fn camera_priority(portal: PortalId, level: u32) -> isize {
    -(level as isize * 2) - portal.index() as isize
}

#[derive(Debug, Default)]
pub struct PortalPlugin {
    pub config: PortalConfig,
}

#[derive(Debug, SystemLabel)]
pub enum PortalLabels {
    RegisterObjects,
    FirePortals,
    Simulate,
    SyncSurfaces,
    Composite,
    ApplyViews,
}

/// Marks a body which can travel through portals. The body entity must carry its collider.
#[derive(Debug, Component, Clone, Default, Reflect, FromReflect)]
#[reflect(Component)]
pub struct Teleportable {
    pub kind: BodyKind,
    /// Point checked against the portal planes, relative to the body. A character's eye.
    pub tracked_offset: Vec3,
    /// Height of the tracked point above the feet, zero for props.
    pub tracked_height: f32,
}

/// Root entity of a surface. Carries the sensor volume other placements must not overlap, the
/// quads are its children.
#[derive(Debug, Component, Clone, Copy, Default, Reflect, FromReflect)]
#[reflect(Component)]
pub struct PortalSurfaceRoot(pub PortalId);

#[derive(Debug, Component, Clone, Copy, Default, Reflect, FromReflect)]
#[reflect(Component)]
pub struct PortalQuad {
    pub surface: PortalId,
    pub level: u32,
    pub open: bool,
}

#[derive(Debug, Component, Clone, Copy, Default, Reflect, FromReflect)]
#[reflect(Component)]
pub struct PortalCamera {
    pub portal: PortalId,
    pub level: u32,
}

#[derive(Debug, Default, Resource)]
struct PortalViews {
    /// `targets[portal][level - 1]` is rendered by the camera of `portal` at `level`.
    targets: [Vec<Handle<Image>>; 2],
    main_camera: Option<Entity>,
}

impl Plugin for PortalPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugin(MaterialPlugin::<OpenPortalMaterial>::default())
            .add_plugin(MaterialPlugin::<ClosedPortalMaterial>::default())
            .add_plugin(CameraProjectionPlugin::<PortalCameraProjection>::default())
            .register_type::<Teleportable>()
            .register_type::<PortalSurfaceRoot>()
            .register_type::<PortalQuad>()
            .register_type::<PortalCamera>()
            .add_event::<PortalFireRequest>()
            .add_event::<PortalEvent>()
            .insert_resource(PortalPair::new(self.config.clone()))
            .init_resource::<RecursiveViewCompositor>()
            .init_resource::<ViewRecorder>()
            .init_resource::<PortalViews>()
            .add_startup_system(setup_portal_views)
            .add_system(update_main_camera)
            .add_system(register_teleportables.label(PortalLabels::RegisterObjects))
            .add_system(
                fire_portals
                    .label(PortalLabels::FirePortals)
                    .after(PortalLabels::RegisterObjects),
            )
            .add_system(
                simulate_portals
                    .label(PortalLabels::Simulate)
                    .after(PortalLabels::FirePortals),
            )
            .add_system(
                sync_surface_entities
                    .label(PortalLabels::SyncSurfaces)
                    .after(PortalLabels::Simulate),
            )
            .add_system_to_stage(CoreStage::PostUpdate, unregister_teleportables)
            .add_system_to_stage(
                CoreStage::PostUpdate,
                composite_portal_views
                    .label(PortalLabels::Composite)
                    .after(TransformSystem::TransformPropagate)
                    .before(CameraUpdateSystem),
            )
            .add_system_to_stage(
                CoreStage::PostUpdate,
                apply_view_commands
                    .label(PortalLabels::ApplyViews)
                    .after(PortalLabels::Composite)
                    .before(CameraUpdateSystem),
            )
            .add_system_to_stage(
                CoreStage::PostUpdate,
                update_frusta::<PortalCameraProjection>
                    .after(TransformSystem::TransformPropagate)
                    .after(PortalLabels::ApplyViews),
            );
    }
}

fn render_target_image(size: UVec2) -> Image {
    let tex_size = Extent3d {
        width: size.x,
        height: size.y,
        ..default()
    };
    let mut image = Image {
        texture_descriptor: TextureDescriptor {
            label: None,
            size: tex_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Bgra8UnormSrgb,
            usage: TextureUsages::TEXTURE_BINDING
                | TextureUsages::COPY_DST
                | TextureUsages::RENDER_ATTACHMENT,
        },
        ..default()
    };
    image.resize(tex_size);
    image
}

/// Spawn the surface roots with their quads, and the portal cameras with their render targets.
fn setup_portal_views(
    mut commands: Commands,
    mut pair: ResMut<PortalPair>,
    mut views: ResMut<PortalViews>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut images: ResMut<Assets<Image>>,
    mut open_materials: ResMut<Assets<OpenPortalMaterial>>,
    mut closed_materials: ResMut<Assets<ClosedPortalMaterial>>,
) {
    let config = pair.config().clone();
    let max_depth = config.view.recursion_limit();
    let half_extents = config.surface.half_extents();
    let mesh = meshes.add(
        shape::Quad {
            size: half_extents * 2.,
            flip: false,
        }
        .into(),
    );

    for portal in PortalId::BOTH {
        views.targets[portal.index()] = (1..=max_depth)
            .map(|_| images.add(render_target_image(DEFAULT_TARGET_SIZE)))
            .collect();
    }

    for surface in PortalId::BOTH {
        let color = config.view.inactive_colors[surface.index()];
        let closed_material = closed_materials.add(ClosedPortalMaterial {
            uniform: PortalUniform::new(&config.view, color),
        });
        let hidden = Visibility { is_visible: false };

        let root = commands
            .spawn((
                SpatialBundle::default(),
                Collider::cuboid(
                    half_extents.x,
                    half_extents.y,
                    config.surface.entry_half_depth,
                ),
                Sensor,
                CollisionGroups::new(PORTAL_GROUP, RAYCAST_GROUP),
                ColliderDisabled,
                PortalSurfaceRoot(surface),
                Name::from(format!("Portal {:?}", surface)),
            ))
            .with_children(|parent| {
                for level in 0..=max_depth {
                    let layer = RenderLayers::layer(surface_layer(surface, level));
                    if level < max_depth {
                        let texture = views.targets[surface.other().index()][level as usize].clone();
                        parent.spawn((
                            MaterialMeshBundle {
                                mesh: mesh.clone(),
                                material: open_materials.add(OpenPortalMaterial {
                                    uniform: PortalUniform::new(&config.view, color),
                                    texture,
                                }),
                                visibility: hidden.clone(),
                                ..default()
                            },
                            layer,
                            PortalQuad {
                                surface,
                                level,
                                open: true,
                            },
                        ));
                    }
                    parent.spawn((
                        MaterialMeshBundle {
                            mesh: mesh.clone(),
                            material: closed_material.clone(),
                            visibility: hidden.clone(),
                            ..default()
                        },
                        layer,
                        PortalQuad {
                            surface,
                            level,
                            open: false,
                        },
                    ));
                }
            })
            .id();
        pair.set_surface_volume(surface, Some(root));
    }

    for portal in PortalId::BOTH {
        for level in 1..=max_depth {
            commands
                .spawn((
                    Camera3dBundle {
                        camera: Camera {
                            priority: camera_priority(portal, level),
                            target: RenderTarget::Image(
                                views.targets[portal.index()][level as usize - 1].clone(),
                            ),
                            is_active: false,
                            ..default()
                        },
                        ..default()
                    },
                    PortalCameraProjection::default(),
                    RenderLayers::layer(0).with(surface_layer(portal.other(), level)),
                    PortalCamera { portal, level },
                    Name::from(format!("Portal {:?} camera {}", portal, level)),
                ))
                .remove::<Projection>();
        }
    }
    info!("Spawned portal views, {} recursion levels", max_depth);
}

/// Obtain the main camera if not already known, and let it see the level 0 quads.
fn update_main_camera(
    mut commands: Commands,
    cameras_query: Query<(&Camera, Entity), With<FirstPersonCamera>>,
    windows: Res<Windows>,
    mut views: ResMut<PortalViews>,
) {
    if views.main_camera.is_some() {
        return;
    }
    if let (Some(primary_win), Ok((camera, entity))) =
        (windows.get_primary(), cameras_query.get_single())
    {
        if camera.target == RenderTarget::Window(primary_win.id()) {
            commands.entity(entity).insert(
                RenderLayers::layer(0)
                    .with(surface_layer(PortalId::A, 0))
                    .with(surface_layer(PortalId::B, 0)),
            );
            info!("Updating main camera to entity {:?}", entity);
            views.main_camera = Some(entity);
        }
    }
}

fn register_teleportables(
    mut commands: Commands,
    mut pair: ResMut<PortalPair>,
    added: Query<(Entity, &Teleportable, &Transform), Added<Teleportable>>,
) {
    for (entity, teleportable, transform) in &added {
        let object = TrackedObject::new(entity, *transform, teleportable.kind)
            .with_tracked_offset(teleportable.tracked_offset)
            .with_tracked_height(teleportable.tracked_height);
        if pair.register_object(entity, object) {
            debug!(
                "Tracking {:?} for portal crossings, {} tracked",
                entity,
                pair.tracker().len()
            );
            // The contact filter is only consulted for colliders asking for it.
            commands
                .entity(entity)
                .insert(ActiveHooks::FILTER_CONTACT_PAIRS);
        }
    }
}

fn unregister_teleportables(
    removed: RemovedComponents<Teleportable>,
    mut pair: ResMut<PortalPair>,
    rapier: Res<RapierContext>,
    mut ignored: ResMut<IgnoredCollisionPairs>,
    materials: Query<&SurfaceMaterial>,
) {
    let mut physics = RapierPortalPhysics::new(&rapier, &mut ignored, &materials);
    for entity in removed.iter() {
        if pair.unregister_object(entity, &mut physics).is_some() {
            debug!(
                "Stopped tracking {:?}, {} tracked",
                entity,
                pair.tracker().len()
            );
        }
    }
}

fn fire_portals(
    mut requests: EventReader<PortalFireRequest>,
    mut pair: ResMut<PortalPair>,
    rapier: Res<RapierContext>,
    mut ignored: ResMut<IgnoredCollisionPairs>,
    materials: Query<&SurfaceMaterial>,
    mut events: EventWriter<PortalEvent>,
) {
    let mut physics = RapierPortalPhysics::new(&rapier, &mut ignored, &materials);
    for request in requests.iter() {
        if let PlacementOutcome::Rejected(reason) = pair.fire(request, &mut physics) {
            info!("Portal {:?} not placed: {:?}", request.portal, reason);
        }
    }
    events.send_batch(pair.drain_events());
}

/// Sync the tracked bodies into the portal pair, step it, and write teleported bodies back.
fn simulate_portals(
    time: Res<Time>,
    mut pair: ResMut<PortalPair>,
    rapier: Res<RapierContext>,
    mut ignored: ResMut<IgnoredCollisionPairs>,
    materials: Query<&SurfaceMaterial>,
    mut bodies: Query<
        (
            Entity,
            &mut Transform,
            Option<&mut Velocity>,
            Option<&mut FirstPersonController>,
        ),
        With<Teleportable>,
    >,
    mut events: EventWriter<PortalEvent>,
) {
    for (entity, transform, velocity, controller) in &bodies {
        if let Some(object) = pair.object_mut(entity) {
            object.body = *transform;
            object.velocity = velocity.copied();
            object.viewpoint = controller.map(|controller| controller.viewpoint());
            object.grounded = controller.map_or(false, |controller| controller.grounded);
        }
    }

    let mut physics = RapierPortalPhysics::new(&rapier, &mut ignored, &materials);
    pair.simulate(time.delta_seconds(), &mut physics);

    for entity in pair.take_teleported() {
        let object = match pair.object(entity) {
            Some(object) => object,
            None => continue,
        };
        if let Ok((_, mut transform, velocity, controller)) = bodies.get_mut(entity) {
            *transform = object.body;
            if let (Some(mut velocity), Some(remapped)) = (velocity, object.velocity) {
                *velocity = remapped;
            }
            if let (Some(mut controller), Some(viewpoint)) = (controller, object.viewpoint) {
                controller.set_viewpoint(viewpoint);
            }
        }
    }
    events.send_batch(pair.drain_events());
}

/// Move the surface roots to their poses, and only let placed volumes take part in queries.
fn sync_surface_entities(
    mut commands: Commands,
    pair: Res<PortalPair>,
    mut roots: Query<(
        Entity,
        &PortalSurfaceRoot,
        &mut Transform,
        Option<&ColliderDisabled>,
    )>,
) {
    for (entity, root, mut transform, disabled) in &mut roots {
        let surface = pair.surface(root.0);
        if surface.is_placed() {
            if *transform != *surface.pose() {
                *transform = *surface.pose();
            }
            if disabled.is_some() {
                commands.entity(entity).remove::<ColliderDisabled>();
            }
        } else if disabled.is_none() {
            commands.entity(entity).insert(ColliderDisabled);
        }
    }
}

fn main_camera_frame(
    views: &PortalViews,
    cameras: &Query<(&GlobalTransform, &Camera, &Projection), Without<PortalCamera>>,
    delta_seconds: f32,
) -> Option<FrameInfo> {
    let (transform, camera, projection) = cameras.get(views.main_camera?).ok()?;
    let perspective = match projection {
        Projection::Perspective(perspective) => perspective,
        Projection::Orthographic(_) => return None,
    };
    Some(FrameInfo {
        viewer: transform.compute_transform(),
        fov: perspective.fov,
        near: perspective.near,
        viewport: camera.physical_viewport_size()?,
        delta_seconds,
    })
}

/// Place the portal cameras for this frame, once the viewer transform is final.
fn composite_portal_views(
    time: Res<Time>,
    pair: Res<PortalPair>,
    views: Res<PortalViews>,
    mut compositor: ResMut<RecursiveViewCompositor>,
    mut recorder: ResMut<ViewRecorder>,
    cameras: Query<(&GlobalTransform, &Camera, &Projection), Without<PortalCamera>>,
) {
    if let Some(frame) = main_camera_frame(&views, &cameras, time.delta_seconds()) {
        compositor.render(&pair, &frame, &mut *recorder);
    }
}

fn apply_view_commands(
    pair: Res<PortalPair>,
    views: Res<PortalViews>,
    mut recorder: ResMut<ViewRecorder>,
    mut images: ResMut<Assets<Image>>,
    main_cameras: Query<&Projection, Without<PortalCamera>>,
    mut cameras: Query<(
        &PortalCamera,
        &mut Camera,
        &mut Transform,
        &mut GlobalTransform,
        &mut PortalCameraProjection,
    )>,
    mut quads: Query<(&PortalQuad, &mut Visibility)>,
) {
    let commands = recorder.take_commands();
    if commands.is_empty() {
        return;
    }

    let mut closed_levels = HashSet::new();
    let mut rendered: HashMap<(PortalId, u32), RecursionFrame> = HashMap::new();
    for command in commands {
        match command {
            ViewCommand::Resize { portal, size } => {
                let size = Extent3d {
                    width: size.x.max(1),
                    height: size.y.max(1),
                    ..default()
                };
                for handle in &views.targets[portal.index()] {
                    if let Some(image) = images.get_mut(handle) {
                        image.resize(size);
                    }
                }
            }
            ViewCommand::Render {
                portal,
                frame,
                counterpart_inactive,
            } => {
                if counterpart_inactive {
                    closed_levels.insert((portal.other(), frame.depth));
                }
                rendered.insert((portal, frame.depth), frame);
            }
            // Overrides reach the quads through the render commands they wrap.
            ViewCommand::InactiveOverride { .. } | ViewCommand::Skip { .. } => {}
        }
    }

    let (fov, near) = match views
        .main_camera
        .and_then(|entity| main_cameras.get(entity).ok())
    {
        Some(Projection::Perspective(perspective)) => (perspective.fov, perspective.near),
        _ => (FRAC_PI_4, 0.1),
    };
    for (portal_camera, mut camera, mut transform, mut global_transform, mut projection) in
        &mut cameras
    {
        match rendered.get(&(portal_camera.portal, portal_camera.level)) {
            Some(frame) => {
                camera.is_active = true;
                *transform = frame.camera;
                *global_transform = GlobalTransform::from(frame.camera);
                projection.fov = fov;
                projection.near = near;
                projection.clip_plane = Some(frame.clip_plane);
            }
            None => camera.is_active = false,
        }
    }

    let max_depth = pair.config().view.recursion_limit();
    for (quad, mut visibility) in &mut quads {
        let surface = pair.surface(quad.surface);
        let open = surface.appearance() == SurfaceAppearance::Active
            && quad.level < max_depth
            && !closed_levels.contains(&(quad.surface, quad.level));
        let is_visible = surface.is_placed() && quad.open == open;
        if visibility.is_visible != is_visible {
            visibility.is_visible = is_visible;
        }
    }
}
