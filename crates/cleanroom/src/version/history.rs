//! Releases published before version documents existed.

use super::ComponentKind;

const CLIENT: &[(&str, &str)] = &[
    ("6bbdb78ed816cc702249dcecac40467b1d31e5c8cfbb1ef312b7d119dde7024f", "1.0.6"),
    ("38a2c27065a9b6785081eb5e4bf9f3ddd219860d06ad65f5aad4e63466996561", "1.0.7"),
    ("8627a64bb0db303e7a837a06f65e91e1ee9c9d59df1228849c09a59571de9121", "1.0.8"),
];

const CONSTITUTION: &[(&str, &str)] = &[
    ("d1e339962fca8d92fe543617c89bb69127dd075feb3599d8a7c71938a0a6a29f", "1.0.6"),
    ("6b5961db2f6c0c9b0a1a640146dceac20e816225b29925891ecbb4b8e0aa9d02", "1.0.8"),
];

const JSAPP: &[(&str, &str)] = &[
    ("01043eb27af3faa8f76c1ef3f95e516dcc0b2b78c71302a878ed968da62967b1", "1.0.6"),
    ("d42383b4a2d6c88c68cb1114e71da6ad0aa724e90297d1ad82db6206eb6fd417", "1.0.8"),
];

/// Historical version of `digest_hex` (no `sha256:` prefix) for `kind`.
pub fn lookup(kind: ComponentKind, digest_hex: &str) -> Option<&'static str> {
    let table = match kind {
        ComponentKind::Client => CLIENT,
        ComponentKind::Constitution => CONSTITUTION,
        ComponentKind::JsApp => JSAPP,
    };
    table
        .iter()
        .find(|(d, _)| d.eq_ignore_ascii_case(digest_hex))
        .map(|(_, v)| *v)
}
