// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.


mod delivery;
