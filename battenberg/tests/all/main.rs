mod helpers;

mod management;
mod streaming;
