//! Application layer: conversion, worker lifecycle and preview orchestration.

pub mod error;
pub mod preview;
pub mod render;
pub mod worker;
