use cv_core::{
    nalgebra::{Point3, Vector3},
    CameraToWorld,
};
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use std::io::{self, Write};

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];

/// A camera drawn as a small pyramid pointing along its optical axis.
pub struct ExportCamera {
    pub optical_center: Point3<f64>,
    pub up_direction: Vector3<f64>,
    pub forward_direction: Vector3<f64>,
    pub size: f64,
}

impl ExportCamera {
    pub fn from_pose(pose: CameraToWorld, size: f64) -> Self {
        Self {
            optical_center: Point3::from(pose.0.translation.vector),
            // Image y points down.
            up_direction: pose.0.rotation * -Vector3::y(),
            forward_direction: pose.0.rotation * Vector3::z(),
            size,
        }
    }
}

/// Writes an ASCII PLY with every point and a marker for every camera.
pub fn export(
    mut writer: impl Write,
    points_and_colors: Vec<(Point3<f64>, [u8; 3])>,
    cameras: Vec<ExportCamera>,
) -> io::Result<()> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push("Exported from mono-slam".to_string());

    let mut point_element = ElementDef::new("vertex".to_string());
    for name in ["x", "y", "z"] {
        let p = PropertyDef::new(name.to_string(), PropertyType::Scalar(ScalarType::Double));
        point_element.properties.add(p);
    }
    for name in ["red", "green", "blue"] {
        let p = PropertyDef::new(name.to_string(), PropertyType::Scalar(ScalarType::UChar));
        point_element.properties.add(p);
    }
    ply.header.elements.add(point_element);

    let mut face_element = ElementDef::new("face".to_string());
    let vertex_list = PropertyDef::new(
        "vertex_index".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    );
    face_element.properties.add(vertex_list);
    ply.header.elements.add(face_element);

    let mut vertices: Vec<DefaultElement> = vec![];
    let mut faces: Vec<DefaultElement> = vec![];

    let mut add_vertex = |p: Point3<f64>, [r, g, b]: [u8; 3]| -> usize {
        let pos = vertices.len();
        let mut point = DefaultElement::new();
        point.insert("x".to_string(), Property::Double(p.x));
        point.insert("y".to_string(), Property::Double(p.y));
        point.insert("z".to_string(), Property::Double(p.z));
        point.insert("red".to_string(), Property::UChar(r));
        point.insert("green".to_string(), Property::UChar(g));
        point.insert("blue".to_string(), Property::UChar(b));
        vertices.push(point);
        pos
    };

    let mut add_triangle = |a: usize, b: usize, c: usize| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(vec![a as i32, b as i32, c as i32]),
        );
        faces.push(face);
    };

    for ExportCamera {
        optical_center,
        up_direction,
        forward_direction,
        size,
    } in cameras
    {
        let right_direction = forward_direction.cross(&up_direction);
        let center_point = add_vertex(optical_center, CAMERA_COLOR);
        let [up_right, up_left, down_left, down_right] =
            [(1, 1), (1, -1), (-1, -1), (-1, 1)].map(|(up, right)| {
                add_vertex(
                    optical_center
                        + forward_direction * size
                        + up as f64 * up_direction * size
                        + right as f64 * right_direction * size,
                    CAMERA_COLOR,
                )
            });
        add_triangle(center_point, down_right, up_right);
        add_triangle(center_point, up_right, up_left);
        add_triangle(center_point, up_left, down_left);
        add_triangle(center_point, down_left, down_right);
    }

    for (p, c) in points_and_colors {
        add_vertex(p, c);
    }

    ply.payload.insert("vertex".to_string(), vertices);
    ply.payload.insert("face".to_string(), faces);

    Writer::new().write_ply(&mut writer, &mut ply)?;
    Ok(())
}
