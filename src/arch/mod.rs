pub mod tinytpu;
