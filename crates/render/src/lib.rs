// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

pub use properties::{merge_properties, parse_properties, render_properties};
pub use renderer::{session_data_dir, write_rendered_files};

pub mod properties;
pub mod renderer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("could not read existing file {path}: {source}")]
    ReadExisting {
        path: String,
        source: std::io::Error,
    },
    #[error("could not write rendered file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}
