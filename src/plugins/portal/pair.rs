//! The two linked surfaces and everything that travels between them.

use bevy::prelude::*;

use crate::plugins::physics::PortalPhysics;

use super::{
    config::PortalConfig,
    crossing::{CrossingTracker, TrackedObject},
    geometry::{adjust_portal_origin_to_obstacles, location_from_impact},
    surface::{PortalId, PortalSurface, SurfaceAppearance},
    teleport::teleport,
};

/// Notifications sent to whoever reacts to portal state, such as materials or UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalEvent {
    Activated(PortalId),
    Removed(PortalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementRejection {
    /// The shot didn't hit anything a portal can go on.
    Missed,
    /// The opening would hang off its mount, or the mount doesn't take portals.
    Overhang,
    /// Something is in the way, possibly the other portal.
    Overlap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementOutcome {
    Placed,
    Removed,
    Rejected(PlacementRejection),
}

/// Request to shoot a portal from `origin` along `direction`, or to remove it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortalFireRequest {
    pub portal: PortalId,
    pub origin: Vec3,
    pub direction: Vec3,
    pub remove: bool,
}

#[derive(Debug, Resource)]
pub struct PortalPair {
    surfaces: [PortalSurface; 2],
    tracker: CrossingTracker,
    config: PortalConfig,
    events: Vec<PortalEvent>,
    teleported: Vec<Entity>,
}

impl Default for PortalPair {
    fn default() -> Self {
        PortalPair::new(PortalConfig::default())
    }
}

impl PortalPair {
    pub fn new(config: PortalConfig) -> Self {
        let surface = |id| PortalSurface::new(id, config.surface.clone(), config.layers.clone());
        PortalPair {
            surfaces: [surface(PortalId::A), surface(PortalId::B)],
            tracker: CrossingTracker::default(),
            config,
            events: Vec::new(),
            teleported: Vec::new(),
        }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn surface(&self, portal: PortalId) -> &PortalSurface {
        &self.surfaces[portal.index()]
    }

    pub fn surfaces(&self) -> &[PortalSurface; 2] {
        &self.surfaces
    }

    pub fn tracker(&self) -> &CrossingTracker {
        &self.tracker
    }

    pub fn is_placed(&self, portal: PortalId) -> bool {
        self.surface(portal).is_placed()
    }

    /// Both surfaces placed, objects and views go through.
    pub fn is_active(&self) -> bool {
        self.surfaces.iter().all(PortalSurface::is_placed)
    }

    pub fn set_surface_volume(&mut self, portal: PortalId, volume: Option<Entity>) {
        self.surfaces[portal.index()].set_volume(volume);
    }

    pub fn is_placement_overhang(&self, portal: PortalId, physics: &dyn PortalPhysics) -> bool {
        self.surface(portal).is_placement_overhang(physics)
    }

    pub fn is_placement_overlap(&self, portal: PortalId, physics: &dyn PortalPhysics) -> bool {
        self.surface(portal).is_placement_overlap(physics)
    }

    /// Mount a surface on `wall` at its current pose.
    pub fn activate(&mut self, portal: PortalId, wall: Option<Entity>) {
        let (index, other) = (portal.index(), portal.other().index());
        if self.surfaces[index].activate(wall) {
            info!(
                "Portal {:?} placed at {}",
                portal,
                self.surfaces[index].pose().translation
            );
            self.events.push(PortalEvent::Activated(portal));
            if self.surfaces[other].is_placed() {
                self.surfaces[other].set_appearance(SurfaceAppearance::Active);
            }
        }
        if self.surfaces[other].is_placed() {
            self.surfaces[index].set_appearance(SurfaceAppearance::Active);
        }
    }

    /// Take a surface down. A temporary removal, used when re-placing a surface, doesn't notify
    /// the counterpart. Returns false if the surface wasn't placed.
    pub fn remove(
        &mut self,
        portal: PortalId,
        temporary: bool,
        physics: &mut dyn PortalPhysics,
    ) -> bool {
        if !self.is_placed(portal) {
            return false;
        }
        self.tracker.exit_all(portal, &mut self.surfaces, physics);
        self.surfaces[portal.index()].mark_removed();
        if !temporary {
            info!("Portal {:?} removed", portal);
            self.events.push(PortalEvent::Removed(portal));
            let other = portal.other();
            self.surfaces[other.index()].set_appearance(SurfaceAppearance::Inactive);
            self.tracker.exit_all(other, &mut self.surfaces, physics);
        }
        true
    }

    /// Move a surface to `pose` on `wall` if the placement is valid there. A rejected placement
    /// leaves the surface where it was.
    pub fn try_place(
        &mut self,
        portal: PortalId,
        pose: Transform,
        wall: Option<Entity>,
        physics: &mut dyn PortalPhysics,
    ) -> PlacementOutcome {
        let index = portal.index();
        let previous = *self.surfaces[index].pose();
        self.surfaces[index].set_pose(pose);

        let rejection = if self.surfaces[index].is_placement_overhang(physics) {
            Some(PlacementRejection::Overhang)
        } else if self.surfaces[index].is_placement_overlap(physics) {
            Some(PlacementRejection::Overlap)
        } else {
            None
        };
        if let Some(rejection) = rejection {
            debug!("Portal {:?} placement rejected: {:?}", portal, rejection);
            self.surfaces[index].set_pose(previous);
            return PlacementOutcome::Rejected(rejection);
        }

        self.remove(portal, true, physics);
        self.activate(portal, wall);
        PlacementOutcome::Placed
    }

    /// Shoot a portal, or remove it.
    pub fn fire(
        &mut self,
        request: &PortalFireRequest,
        physics: &mut dyn PortalPhysics,
    ) -> PlacementOutcome {
        if request.remove {
            self.remove(request.portal, false, physics);
            return PlacementOutcome::Removed;
        }

        info!("Shooting portal {:?}", request.portal);
        let layers = &self.config.layers;
        let hit = match physics.cast_ray(
            request.origin,
            request.direction,
            f32::MAX,
            layers.placement(),
        ) {
            Some(hit) => hit,
            None => return PlacementOutcome::Rejected(PlacementRejection::Missed),
        };
        let mut pose = location_from_impact(hit.point, hit.normal, request.direction);
        if self.config.surface.nudge_placement {
            pose.translation = adjust_portal_origin_to_obstacles(
                &pose,
                self.config.surface.half_extents(),
                self.config.surface.placement_clearance,
                layers.placement(),
                physics,
            );
        }
        self.try_place(request.portal, pose, Some(hit.collider), physics)
    }

    pub fn register_object(&mut self, entity: Entity, object: TrackedObject) -> bool {
        self.tracker.register(entity, object)
    }

    pub fn unregister_object(
        &mut self,
        entity: Entity,
        physics: &mut dyn PortalPhysics,
    ) -> Option<TrackedObject> {
        self.tracker.unregister(entity, &mut self.surfaces, physics)
    }

    pub fn object(&self, entity: Entity) -> Option<&TrackedObject> {
        self.tracker.get(entity)
    }

    pub fn object_mut(&mut self, entity: Entity) -> Option<&mut TrackedObject> {
        self.tracker.get_mut(entity)
    }

    pub fn enter_portal(
        &mut self,
        entity: Entity,
        portal: PortalId,
        physics: &mut dyn PortalPhysics,
    ) -> bool {
        self.tracker
            .enter_portal(entity, portal, &mut self.surfaces, physics)
    }

    pub fn exit_portal(
        &mut self,
        entity: Entity,
        portal: PortalId,
        physics: &mut dyn PortalPhysics,
    ) -> bool {
        self.tracker
            .exit_portal(entity, portal, &mut self.surfaces, physics)
    }

    /// Send an object from behind `from` out of the other surface, and enter it there right away
    /// so nothing behind the destination collides with it.
    pub fn teleport(&mut self, entity: Entity, from: PortalId, physics: &mut dyn PortalPhysics) {
        let source = &self.surfaces[from.index()];
        let destination = &self.surfaces[from.other().index()];
        match self.tracker.get_mut(entity) {
            Some(object) => teleport(object, source, destination, &self.config.teleport),
            None => return,
        }
        info!(
            "Teleported {:?} from portal {:?} to portal {:?}",
            entity,
            from,
            from.other()
        );
        self.tracker.mark_teleported(entity);
        self.tracker
            .enter_portal(entity, from.other(), &mut self.surfaces, physics);
        self.teleported.push(entity);
    }

    /// Advance the simulation by `dt` seconds.
    pub fn simulate(&mut self, dt: f32, physics: &mut dyn PortalPhysics) {
        if dt <= 0. {
            return;
        }
        self.tracker.begin_tick();
        for surface in self.surfaces.iter_mut() {
            surface.advance(dt);
        }
        if !self.is_active() {
            self.tracker.take_deferred();
            return;
        }

        for check in self.tracker.take_deferred() {
            let surface = &self.surfaces[check.portal.index()];
            let inside_opening = self
                .tracker
                .get(check.object)
                .map_or(false, |object| {
                    surface.contains_laterally(surface.local_point(object.tracked_point()))
                });
            if inside_opening
                && self
                    .tracker
                    .has_crossed(check.object, check.portal, &self.surfaces)
            {
                debug!(
                    "{:?} went through portal {:?} between two ticks",
                    check.object, check.portal
                );
                self.teleport(check.object, check.portal, physics);
            }
        }

        for surface in self.surfaces.iter_mut() {
            if !surface.is_blocking_colliders_up_to_date() {
                surface.update_blocking_colliders(physics);
            }
        }

        let groups = self.config.layers.tracked();
        for portal in PortalId::BOTH {
            self.tracker
                .poll_membership(portal, &mut self.surfaces, groups, physics);
        }

        for portal in PortalId::BOTH {
            let mut entered: Vec<Entity> = self.surfaces[portal.index()]
                .entered_objects()
                .iter()
                .copied()
                .collect();
            entered.sort();
            for entity in entered {
                self.tracker
                    .reconcile(entity, portal, &self.surfaces, physics);
                if self.tracker.has_crossed(entity, portal, &self.surfaces) {
                    self.teleport(entity, portal, physics);
                }
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<PortalEvent> {
        std::mem::take(&mut self.events)
    }

    /// Objects teleported since the last call, whose new state must be written back.
    pub fn take_teleported(&mut self) -> Vec<Entity> {
        std::mem::take(&mut self.teleported)
    }
}
