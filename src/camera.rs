// A view + projection pair
//
// Shadow maps render the scene from their light's point of view; each
// shadow slot owns one of these and the pool packs view x projection
// into the shadow matrix buffer every frame.

use cgmath::{ortho, perspective, Deg, Matrix4, Point3, SquareMatrix, Vector3};

#[derive(Debug, Clone)]
pub struct Camera {
    c_view: Matrix4<f32>,
    c_proj: Matrix4<f32>,
}

impl Camera {
    pub fn new() -> Self {
        Self {
            c_view: Matrix4::identity(),
            c_proj: Matrix4::identity(),
        }
    }

    pub fn look_at(&mut self, eye: Point3<f32>, center: Point3<f32>, up: Vector3<f32>) {
        self.c_view = Matrix4::look_at(eye, center, up);
    }

    pub fn set_view(&mut self, view: Matrix4<f32>) {
        self.c_view = view;
    }

    pub fn make_orthogonal(
        &mut self,
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    ) {
        self.c_proj = ortho(left, right, bottom, top, near, far);
    }

    pub fn make_perspective(&mut self, fovy_degrees: f32, aspect: f32, near: f32, far: f32) {
        self.c_proj = perspective(Deg(fovy_degrees), aspect, near, far);
    }

    pub fn view_matrix(&self) -> Matrix4<f32> {
        self.c_view
    }

    pub fn projection_matrix(&self) -> Matrix4<f32> {
        self.c_proj
    }

    /// The combined matrix written to GPU buffers.
    pub fn view_projection(&self) -> Matrix4<f32> {
        self.c_proj * self.c_view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_by_default() {
        let cam = Camera::new();
        assert_eq!(cam.view_projection(), Matrix4::identity());
    }
}
